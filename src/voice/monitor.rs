//! Voice activity monitoring
//!
//! Samples the microphone once per frame tick, reduces the spectrum to a
//! single 0-255 level and reports it. When the level passes the activity gate
//! the silence timer is re-armed; if no further active frame arrives before
//! the window elapses a single silence event is raised for that episode.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::analyser::{FrequencyAnalyser, level_to_db, mean_level};
use super::capture::{
    CaptureConstraints, CaptureOwner, Microphone, MicrophoneArbiter, MicrophoneLease, OpenCapture,
    stop_tracks,
};
use crate::Result;

/// Configuration for silence detection
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Mean level, in approximate dB, above which a frame counts as speech
    pub silence_threshold_db: f32,
    /// Silence sustained this long after the last speech frame ends the turn
    pub silence_window: Duration,
    pub sample_rate: u32,
    pub fft_size: usize,
    /// Sampling cadence (one analysis per tick)
    pub frame_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            silence_threshold_db: -40.0,
            silence_window: Duration::from_millis(2000),
            sample_rate: super::capture::SAMPLE_RATE,
            fft_size: 256,
            frame_interval: Duration::from_millis(16),
        }
    }
}

/// Decides whether a frame level counts as speech
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivityGate {
    /// Active when the level converted to dB exceeds this value
    Decibels(f32),
    /// Active when the raw 0-255 level exceeds this value
    Amplitude(u8),
}

impl ActivityGate {
    #[must_use]
    pub fn is_active(self, level: u8) -> bool {
        match self {
            Self::Decibels(threshold) => level_to_db(f32::from(level)) > threshold,
            Self::Amplitude(threshold) => level > threshold,
        }
    }
}

/// Instantaneous level reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevelSample {
    pub level: u8,
    /// Milliseconds since the monitor started
    pub timestamp_ms: u64,
}

/// Raised once per speaking episode after sustained silence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilenceEvent {
    /// When the last active frame was seen
    pub last_speech_ms: u64,
    /// When the timer fired
    pub fired_at_ms: u64,
}

/// Events produced by a running monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Every analysed frame
    Level(AudioLevelSample),
    /// First active frame after a quiet stretch
    SpeechStarted(AudioLevelSample),
    Silence(SilenceEvent),
}

/// Receiver of monitor events
pub trait MonitorSink: Send + Sync + 'static {
    fn on_level(&self, sample: AudioLevelSample);

    fn on_speech(&self, _sample: AudioLevelSample) {}

    fn on_silence(&self, _event: SilenceEvent) {}
}

impl MonitorSink for mpsc::UnboundedSender<MonitorEvent> {
    fn on_level(&self, sample: AudioLevelSample) {
        let _ = self.send(MonitorEvent::Level(sample));
    }

    fn on_speech(&self, sample: AudioLevelSample) {
        let _ = self.send(MonitorEvent::SpeechStarted(sample));
    }

    fn on_silence(&self, event: SilenceEvent) {
        let _ = self.send(MonitorEvent::Silence(event));
    }
}

/// Outcome of feeding one frame to a [`SilenceTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Observation {
    /// This frame started a new speaking episode
    pub speech_started: bool,
    pub silence: Option<SilenceEvent>,
}

/// "Silence since last speech" timer, driven by explicit timestamps
#[derive(Debug, Clone)]
pub struct SilenceTracker {
    window_ms: u64,
    last_speech_ms: Option<u64>,
    speaking: bool,
}

impl SilenceTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            last_speech_ms: None,
            speaking: false,
        }
    }

    /// When the armed timer will fire, if armed
    #[must_use]
    pub fn deadline_ms(&self) -> Option<u64> {
        self.last_speech_ms
            .map(|last| last.saturating_add(self.window_ms))
    }

    /// Feed one frame
    pub fn observe(&mut self, active: bool, now_ms: u64) -> Observation {
        if active {
            let speech_started = !self.speaking;
            self.speaking = true;
            self.last_speech_ms = Some(now_ms);
            return Observation {
                speech_started,
                silence: None,
            };
        }

        Observation {
            speech_started: false,
            silence: self.poll(now_ms),
        }
    }

    /// Fire the timer if its deadline has passed
    pub fn poll(&mut self, now_ms: u64) -> Option<SilenceEvent> {
        let deadline = self.deadline_ms()?;
        if now_ms < deadline {
            return None;
        }

        let last_speech_ms = self.last_speech_ms.take()?;
        self.speaking = false;
        Some(SilenceEvent {
            last_speech_ms,
            fired_at_ms: now_ms,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Capturing,
    Stopped,
}

struct Running {
    phase: Phase,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Microphone level monitor with silence detection
///
/// Holds the microphone lease for as long as it captures. `stop` is
/// idempotent, may be called before `start` finishes, and returns only after
/// every track has been stopped and the lease released.
pub struct VoiceActivityMonitor {
    microphone: Arc<dyn Microphone>,
    arbiter: MicrophoneArbiter,
    config: MonitorConfig,
    gate: ActivityGate,
    owner: CaptureOwner,
    sink: Arc<dyn MonitorSink>,
    running: Mutex<Running>,
}

impl std::fmt::Debug for VoiceActivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceActivityMonitor")
            .field("owner", &self.owner)
            .field("gate", &self.gate)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl VoiceActivityMonitor {
    /// Silence monitor for normal turn-taking, gated on `silence_threshold_db`
    #[must_use]
    pub fn new(
        microphone: Arc<dyn Microphone>,
        arbiter: MicrophoneArbiter,
        config: MonitorConfig,
        sink: Arc<dyn MonitorSink>,
    ) -> Self {
        let gate = ActivityGate::Decibels(config.silence_threshold_db);
        Self::with_gate(microphone, arbiter, config, gate, CaptureOwner::VoiceActivity, sink)
    }

    /// Monitor with an explicit gate and capture owner
    #[must_use]
    pub fn with_gate(
        microphone: Arc<dyn Microphone>,
        arbiter: MicrophoneArbiter,
        config: MonitorConfig,
        gate: ActivityGate,
        owner: CaptureOwner,
        sink: Arc<dyn MonitorSink>,
    ) -> Self {
        Self {
            microphone,
            arbiter,
            config,
            gate,
            owner,
            sink,
            running: Mutex::new(Running {
                phase: Phase::Idle,
                cancel: CancellationToken::new(),
                task: None,
            }),
        }
    }

    /// Whether the monitor is starting or capturing
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.lock().phase, Phase::Starting | Phase::Capturing)
    }

    /// Acquire the microphone and begin sampling
    ///
    /// Starting a monitor that is already running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the microphone is held elsewhere, access is denied,
    /// or no device is available
    pub async fn start(&self) -> Result<()> {
        let cancel = {
            let mut running = self.lock();
            if matches!(running.phase, Phase::Starting | Phase::Capturing) {
                tracing::warn!(owner = %self.owner, "monitor already running, ignoring start");
                return Ok(());
            }
            running.phase = Phase::Starting;
            running.cancel = CancellationToken::new();
            running.cancel.clone()
        };

        let lease = match self.arbiter.acquire(self.owner) {
            Ok(lease) => lease,
            Err(e) => {
                self.lock().phase = Phase::Idle;
                return Err(e);
            }
        };

        let constraints = CaptureConstraints::speech(self.config.sample_rate);
        let capture = match self.microphone.open(&constraints).await {
            Ok(capture) => capture,
            Err(e) => {
                self.lock().phase = Phase::Idle;
                return Err(e);
            }
        };

        if let Some(capture) = self.spawn_capture(capture, lease, cancel) {
            // Stopped while the device was opening
            stop_tracks(capture.tracks).await;
            tracing::debug!(owner = %self.owner, "monitor stopped before capture began");
        }
        Ok(())
    }

    /// Hand the capture to the sampling task, or give it back if cancelled
    fn spawn_capture(
        &self,
        capture: OpenCapture,
        lease: MicrophoneLease,
        cancel: CancellationToken,
    ) -> Option<OpenCapture> {
        let mut running = self.lock();
        if cancel.is_cancelled() {
            drop(lease);
            return Some(capture);
        }

        let task = tokio::spawn(run_monitor(
            capture,
            lease,
            cancel,
            self.config.clone(),
            self.gate,
            Arc::clone(&self.sink),
        ));
        running.phase = Phase::Capturing;
        running.task = Some(task);

        tracing::debug!(owner = %self.owner, gate = ?self.gate, "monitor started");
        None
    }

    /// Stop sampling and release the microphone
    pub async fn stop(&self) {
        let task = {
            let mut running = self.lock();
            running.cancel.cancel();
            if running.phase != Phase::Idle {
                running.phase = Phase::Stopped;
            }
            running.task.take()
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(owner = %self.owner, error = %e, "monitor task ended abnormally");
            }
            tracing::debug!(owner = %self.owner, "monitor stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for VoiceActivityMonitor {
    fn drop(&mut self) {
        self.lock().cancel.cancel();
    }
}

async fn run_monitor(
    mut capture: OpenCapture,
    lease: MicrophoneLease,
    cancel: CancellationToken,
    config: MonitorConfig,
    gate: ActivityGate,
    sink: Arc<dyn MonitorSink>,
) {
    let mut analyser = FrequencyAnalyser::new(config.fft_size);
    let mut tracker = SilenceTracker::new(config.silence_window);
    let started = Instant::now();
    let elapsed_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let mut ticker = tokio::time::interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = tracker
            .deadline_ms()
            .map(|ms| started + Duration::from_millis(ms));

        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            frame = capture.frames.recv() => match frame {
                Some(samples) => analyser.push_samples(&samples),
                None => {
                    tracing::warn!(owner = %lease.owner(), "capture stream ended");
                    break;
                }
            },

            () = sleep_until_deadline(deadline) => {
                if let Some(event) = tracker.poll(elapsed_ms()) {
                    tracing::debug!(last_speech_ms = event.last_speech_ms, "silence sustained");
                    sink.on_silence(event);
                }
            }

            _ = ticker.tick() => {
                let level = mean_level(&analyser.byte_frequency_data());
                let sample = AudioLevelSample { level, timestamp_ms: elapsed_ms() };
                sink.on_level(sample);

                let observed = tracker.observe(gate.is_active(level), sample.timestamp_ms);
                if observed.speech_started {
                    tracing::trace!(level, "speech started");
                    sink.on_speech(sample);
                }
                if let Some(event) = observed.silence {
                    sink.on_silence(event);
                }
            }
        }
    }

    stop_tracks(capture.tracks).await;
    drop(lease);
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME_MS: u64 = 16;

    /// Feed frames `[from, to)` at the frame cadence, collecting silences
    fn run(tracker: &mut SilenceTracker, from: u64, to: u64, active: bool) -> Vec<SilenceEvent> {
        (from..to)
            .step_by(FRAME_MS as usize)
            .filter_map(|t| tracker.observe(active, t).silence)
            .collect()
    }

    #[test]
    fn fires_once_after_sustained_silence() {
        let mut tracker = SilenceTracker::new(Duration::from_millis(2000));
        assert!(run(&mut tracker, 0, 1000, true).is_empty());

        let last_speech = tracker.last_speech_ms.unwrap();
        let fired = run(&mut tracker, last_speech + FRAME_MS, last_speech + 2100, false);
        assert_eq!(fired.len(), 1);
        assert!(fired[0].fired_at_ms >= last_speech + 2000);
        assert_eq!(fired[0].last_speech_ms, last_speech);

        // Further silence does not re-fire
        assert!(run(&mut tracker, last_speech + 2100, last_speech + 6000, false).is_empty());
    }

    #[test]
    fn late_speech_resets_timer() {
        let mut tracker = SilenceTracker::new(Duration::from_millis(2000));
        tracker.observe(true, 0);

        assert!(run(&mut tracker, 16, 1900, false).is_empty());
        assert!(tracker.observe(true, 1900).silence.is_none());

        // Nothing at the original deadline
        assert!(run(&mut tracker, 1916, 3900, false).is_empty());

        let fired = tracker.observe(false, 3900).silence.unwrap();
        assert_eq!(fired.last_speech_ms, 1900);
    }

    #[test]
    fn silence_without_speech_never_fires() {
        let mut tracker = SilenceTracker::new(Duration::from_millis(2000));
        assert!(run(&mut tracker, 0, 10_000, false).is_empty());
        assert_eq!(tracker.deadline_ms(), None);
    }

    #[test]
    fn speech_onset_reported_once_per_episode() {
        let mut tracker = SilenceTracker::new(Duration::from_millis(100));
        assert!(tracker.observe(true, 0).speech_started);
        assert!(!tracker.observe(true, 16).speech_started);
        assert!(tracker.observe(false, 200).silence.is_some());
        assert!(tracker.observe(true, 300).speech_started);
    }

    #[test]
    fn gates() {
        assert!(ActivityGate::Amplitude(30).is_active(31));
        assert!(!ActivityGate::Amplitude(30).is_active(30));
        // -40 dB is 1% of full scale: 2.55
        assert!(ActivityGate::Decibels(-40.0).is_active(3));
        assert!(!ActivityGate::Decibels(-40.0).is_active(2));
        assert!(!ActivityGate::Decibels(-40.0).is_active(0));
    }
}
