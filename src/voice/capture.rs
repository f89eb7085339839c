//! Microphone capture and arbitration
//!
//! The microphone is a single hardware resource. Components never open it
//! directly; they take a [`MicrophoneLease`] from the shared
//! [`MicrophoneArbiter`] first, and the lease is released when dropped.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Sample rate for speech capture (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Frames buffered between the device callback and the consumer
const FRAME_QUEUE: usize = 64;

/// Requested properties of a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Mono, echo-cancelled, noise-suppressed, auto-gain speech capture
    #[must_use]
    pub const fn speech(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::speech(SAMPLE_RATE)
    }
}

/// Live tracks behind an open capture
pub trait MediaTracks: Send {
    /// Stop every track; must be idempotent
    fn stop_all(&mut self);

    /// Number of tracks still delivering audio
    fn live_count(&self) -> usize;
}

/// Stop `tracks` on the blocking pool
///
/// Device backends may join threads while stopping, which must not happen on
/// a runtime worker.
pub async fn stop_tracks(mut tracks: Box<dyn MediaTracks>) {
    let stopped = tokio::task::spawn_blocking(move || {
        tracks.stop_all();
        tracks.live_count()
    })
    .await;

    match stopped {
        Ok(0) => {}
        Ok(live) => tracing::warn!(live, "tracks still live after stop"),
        Err(e) => tracing::warn!(error = %e, "stopping capture tracks failed"),
    }
}

/// An open microphone stream
pub struct OpenCapture {
    /// Blocks of mono samples in [-1.0, 1.0]
    pub frames: mpsc::Receiver<Vec<f32>>,
    pub tracks: Box<dyn MediaTracks>,
}

impl fmt::Debug for OpenCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenCapture")
            .field("live_tracks", &self.tracks.live_count())
            .finish_non_exhaustive()
    }
}

/// Permission-gated microphone capability
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Open a capture stream
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when access is refused, or
    /// [`Error::Audio`] when no suitable device is available
    async fn open(&self, constraints: &CaptureConstraints) -> Result<OpenCapture>;
}

/// Component that holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOwner {
    VoiceActivity,
    BargeIn,
    WakeWord,
    Diagnostics,
}

impl fmt::Display for CaptureOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::VoiceActivity => "voice-activity",
            Self::BargeIn => "barge-in",
            Self::WakeWord => "wake-word",
            Self::Diagnostics => "diagnostics",
        };
        f.write_str(name)
    }
}

/// Grants the microphone to one owner at a time
#[derive(Debug, Clone, Default)]
pub struct MicrophoneArbiter {
    holder: Arc<Mutex<Option<CaptureOwner>>>,
}

impl MicrophoneArbiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive ownership of the microphone
    ///
    /// # Errors
    ///
    /// Returns [`Error::MicrophoneBusy`] if another owner holds it
    pub fn acquire(&self, owner: CaptureOwner) -> Result<MicrophoneLease> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *holder {
            tracing::warn!(%owner, %current, "microphone already in use, rejecting capture");
            return Err(Error::MicrophoneBusy(current.to_string()));
        }

        *holder = Some(owner);
        tracing::debug!(%owner, "microphone acquired");

        Ok(MicrophoneLease {
            holder: Arc::clone(&self.holder),
            owner,
        })
    }

    /// Current owner, if any
    #[must_use]
    pub fn holder(&self) -> Option<CaptureOwner> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on the microphone, released on drop
#[derive(Debug)]
pub struct MicrophoneLease {
    holder: Arc<Mutex<Option<CaptureOwner>>>,
    owner: CaptureOwner,
}

impl MicrophoneLease {
    #[must_use]
    pub const fn owner(&self) -> CaptureOwner {
        self.owner
    }
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if *holder == Some(self.owner) {
            *holder = None;
            tracing::debug!(owner = %self.owner, "microphone released");
        }
    }
}

/// Default input device via `cpal`
///
/// The device stream lives on its own thread because `cpal` streams are not
/// `Send`; stopping the tracks signals that thread and joins it.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<OpenCapture> {
        if constraints.echo_cancellation || constraints.noise_suppression {
            tracing::debug!("cpal backend has no echo cancellation or noise suppression");
        }

        let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let constraints = *constraints;

        let thread = std::thread::Builder::new()
            .name("kaeva-capture".to_string())
            .spawn(move || run_capture_thread(constraints, frame_tx, ready_tx, &stop_rx))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(OpenCapture {
                frames,
                tracks: Box::new(CpalTracks {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }),
            }),
            Ok(Err(e)) => {
                join_capture_thread(thread).await;
                Err(e)
            }
            Err(_) => {
                join_capture_thread(thread).await;
                Err(Error::Audio("capture thread exited before start".to_string()))
            }
        }
    }
}

async fn join_capture_thread(thread: JoinHandle<()>) {
    let joined = tokio::task::spawn_blocking(move || thread.join().is_ok()).await;
    if !matches!(joined, Ok(true)) {
        tracing::warn!("capture thread panicked during startup");
    }
}

fn run_capture_thread(
    constraints: CaptureConstraints,
    frame_tx: mpsc::Sender<Vec<f32>>,
    ready_tx: oneshot::Sender<Result<()>>,
    stop_rx: &std::sync::mpsc::Receiver<()>,
) {
    let stream = match build_input_stream(constraints, frame_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(classify_play_error(&e.to_string())));
        return;
    }

    tracing::debug!(sample_rate = constraints.sample_rate, "audio capture started");
    let _ = ready_tx.send(Ok(()));

    // Blocks until the tracks are stopped or dropped
    let _ = stop_rx.recv();
    drop(stream);
    tracing::debug!("audio capture stopped");
}

fn build_input_stream(
    constraints: CaptureConstraints,
    frame_tx: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let rate = SampleRate(constraints.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| classify_play_error(&e.to_string()))?
        .find(|c| {
            c.channels() == constraints.channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(rate).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = constraints.sample_rate,
        channels = config.channels,
        "audio capture initialized"
    );

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // A slow consumer loses frames rather than stalling the device
                let _ = frame_tx.try_send(data.to_vec());
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| classify_play_error(&e.to_string()))
}

fn classify_play_error(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("not allowed") || lower.contains("denied") {
        Error::PermissionDenied(message.to_string())
    } else {
        Error::Audio(message.to_string())
    }
}

struct CpalTracks {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MediaTracks for CpalTracks {
    fn stop_all(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked during shutdown");
            }
        }
    }

    fn live_count(&self) -> usize {
        usize::from(self.thread.is_some())
    }
}

impl Drop for CpalTracks {
    fn drop(&mut self) {
        self.stop_all();
    }
}
