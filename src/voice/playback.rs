//! Agent audio playback
//!
//! [`AudioPlayer`] turns a decoded WAV container into samples, applies the
//! volume and hands them to an [`AudioSink`]. Every playback owns a
//! [`PlaybackResource`] that is released exactly once, whether playback
//! completes, fails or is interrupted.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{DEFAULT_SAMPLE_RATE, PlayableAudio};
use crate::{Error, Result};

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Output volume in [0, 1]
    pub volume: f32,
    /// Sample rate assumed for chunks without a rate hint
    pub default_sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            default_sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
}

/// Output device capability
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play mono samples to completion or until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns [`Error::Playback`] if the device refuses playback
    async fn play(&self, samples: Vec<f32>, sample_rate: u32, cancel: CancellationToken) -> Result<()>;
}

/// Counts playback resources that have not been released yet
#[derive(Debug, Clone, Default)]
pub struct ResourceTracker {
    live: Arc<AtomicUsize>,
}

impl ResourceTracker {
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn claim(&self) -> PlaybackResource {
        self.live.fetch_add(1, Ordering::SeqCst);
        PlaybackResource {
            live: Arc::clone(&self.live),
            released: AtomicBool::new(false),
        }
    }
}

/// Handle on one playback's buffer; released on drop
#[derive(Debug)]
pub struct PlaybackResource {
    live: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl PlaybackResource {
    /// Release now; later calls and the eventual drop are no-ops
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for PlaybackResource {
    fn drop(&mut self) {
        self.release();
    }
}

/// A running playback
#[derive(Debug)]
pub struct PlaybackHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<PlaybackOutcome>>,
    /// Outcome of the finished task, replayed to later waiters
    done: Option<std::result::Result<PlaybackOutcome, String>>,
}

impl PlaybackHandle {
    /// Interrupt playback (e.g., on barge-in)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for playback to end
    ///
    /// Cancel-safe. Once playback has ended, further calls return the same
    /// outcome (a failure comes back as [`Error::Playback`]).
    ///
    /// # Errors
    ///
    /// Returns the sink's error, or [`Error::Playback`] if the task panicked
    pub async fn wait(&mut self) -> Result<PlaybackOutcome> {
        if let Some(done) = &self.done {
            return done.clone().map_err(Error::Playback);
        }

        let result = match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(Error::Playback(format!("playback task failed: {e}"))),
        };
        self.done = Some(result.as_ref().copied().map_err(|e| match e {
            Error::Playback(msg) => msg.clone(),
            other => other.to_string(),
        }));
        result
    }

    /// Wait for playback to end
    ///
    /// # Errors
    ///
    /// Returns the sink's error, or [`Error::Playback`] if the task panicked
    pub async fn finished(mut self) -> Result<PlaybackOutcome> {
        self.wait().await
    }
}

/// Plays decoded agent audio through a sink
#[derive(Clone)]
pub struct AudioPlayer {
    sink: Arc<dyn AudioSink>,
    resources: ResourceTracker,
}

impl std::fmt::Debug for AudioPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPlayer")
            .field("live_resources", &self.resources.live())
            .finish_non_exhaustive()
    }
}

impl AudioPlayer {
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            resources: ResourceTracker::default(),
        }
    }

    /// Playback buffers not yet released
    #[must_use]
    pub fn live_resources(&self) -> usize {
        self.resources.live()
    }

    /// Start playing `audio` at `volume` (clamped to [0, 1])
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the container cannot be parsed
    pub fn play(&self, audio: &PlayableAudio, volume: f32) -> Result<PlaybackHandle> {
        let resource = self.resources.claim();
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };

        // On error the resource is dropped (released) here
        let (samples, sample_rate) = read_container(&audio.container, volume)?;

        let cancel = CancellationToken::new();
        let sink = Arc::clone(&self.sink);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let result = sink.play(samples, sample_rate, token.clone()).await;
            resource.release();
            match result {
                Ok(()) if token.is_cancelled() => Ok(PlaybackOutcome::Interrupted),
                Ok(()) => Ok(PlaybackOutcome::Completed),
                Err(e) => {
                    tracing::warn!(error = %e, "playback failed");
                    Err(e)
                }
            }
        });

        Ok(PlaybackHandle {
            cancel,
            task,
            done: None,
        })
    }
}

/// Parse a WAV container into volume-scaled mono samples
fn read_container(container: &[u8], volume: f32) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(container))
        .map_err(|e| Error::Decode(format!("invalid WAV container: {e}")))?;
    let spec = reader.spec();

    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::Decode(format!(
            "unsupported sample format: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let channels = usize::from(spec.channels.max(1));
    let raw = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Decode(format!("truncated PCM data: {e}")))?;

    #[allow(clippy::cast_precision_loss)]
    let samples = raw
        .chunks(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
            sum / frame.len() as f32 * volume
        })
        .collect();

    Ok((samples, spec.sample_rate))
}

/// Default output device via `cpal`
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSink;

impl CpalSink {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, samples: Vec<f32>, sample_rate: u32, cancel: CancellationToken) -> Result<()> {
        tokio::task::spawn_blocking(move || play_blocking(&samples, sample_rate, &cancel))
            .await
            .map_err(|e| Error::Playback(format!("playback thread failed: {e}")))?
    }
}

fn output_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
    };

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

    Ok(supported.with_sample_rate(rate).config())
}

fn play_blocking(samples: &[f32], sample_rate: u32, cancel: &CancellationToken) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let config = output_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    let samples = Arc::new(samples.to_vec());
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicBool::new(false));

    let samples_cb = Arc::clone(&samples);
    let position_cb = Arc::clone(&position);
    let finished_cb = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = position_cb.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let sample = samples_cb.get(*pos).copied().unwrap_or_else(|| {
                        finished_cb.store(true, Ordering::SeqCst);
                        0.0
                    });
                    frame.fill(sample);
                    if *pos < samples_cb.len() {
                        *pos += 1;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::Playback(format!("output blocked: {e}")))?;

    let duration_ms = (samples.len() as u64 * 1000) / u64::from(sample_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = std::time::Instant::now();

    while !finished.load(Ordering::SeqCst) && !cancel.is_cancelled() {
        if start.elapsed() > timeout {
            tracing::warn!("playback did not drain before timeout");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(samples = samples.len(), interrupted = cancel.is_cancelled(), "playback complete");
    Ok(())
}
