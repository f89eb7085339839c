//! Barge-in detection
//!
//! While the agent is speaking, a more sensitive monitor watches for the user
//! talking over it. Silence is irrelevant here; only speech onset matters.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::capture::{CaptureOwner, Microphone, MicrophoneArbiter};
use super::monitor::{ActivityGate, AudioLevelSample, MonitorConfig, MonitorSink, VoiceActivityMonitor};
use crate::{Error, Result};

/// The user started speaking over the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BargeInEvent {
    pub level: u8,
    pub timestamp_ms: u64,
}

struct BargeInSink {
    events: mpsc::UnboundedSender<BargeInEvent>,
}

impl MonitorSink for BargeInSink {
    fn on_level(&self, _sample: AudioLevelSample) {}

    fn on_speech(&self, sample: AudioLevelSample) {
        tracing::debug!(level = sample.level, "barge-in detected");
        let _ = self.events.send(BargeInEvent {
            level: sample.level,
            timestamp_ms: sample.timestamp_ms,
        });
    }
}

/// Low-latency interruption detector
#[derive(Debug)]
pub struct BargeInDetector {
    monitor: VoiceActivityMonitor,
}

impl BargeInDetector {
    /// Create a detector that fires when the mean level exceeds `threshold`
    #[must_use]
    pub fn new(
        microphone: Arc<dyn Microphone>,
        arbiter: MicrophoneArbiter,
        config: MonitorConfig,
        threshold: u8,
        events: mpsc::UnboundedSender<BargeInEvent>,
    ) -> Self {
        let monitor = VoiceActivityMonitor::with_gate(
            microphone,
            arbiter,
            config,
            ActivityGate::Amplitude(threshold),
            CaptureOwner::BargeIn,
            Arc::new(BargeInSink { events }),
        );
        Self { monitor }
    }

    /// Begin watching for interruptions
    ///
    /// A no-op with a warning if this or another barge-in detector is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns error if the microphone is held by a different component or
    /// cannot be opened
    pub async fn start(&self) -> Result<()> {
        if self.monitor.is_running() {
            tracing::warn!("barge-in detector already running");
            return Ok(());
        }

        match self.monitor.start().await {
            Err(Error::MicrophoneBusy(holder)) if holder == CaptureOwner::BargeIn.to_string() => {
                tracing::warn!("another barge-in detector is active, ignoring start");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn stop(&self) {
        self.monitor.stop().await;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.monitor.is_running()
    }
}
