//! Shared test utilities
//!
//! Fakes for every external capability the engine depends on, so sessions
//! run end to end without audio hardware or a network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kaeva_voice::agent::{AgentChannel, AgentConnection, AgentEvent};
use kaeva_voice::voice::{
    AudioSink, CaptureConstraints, MediaTracks, Microphone, OpenCapture, RecognitionEvent,
    SpeechRecognizer,
};
use kaeva_voice::{AgentType, DbPool, Result, SqliteStore, ToolResult, db};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Data store over a fresh in-memory database
#[must_use]
pub fn setup_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(setup_test_db()))
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Deterministic broadband noise, loud enough to read as speech
#[must_use]
pub fn noise(len: usize, seed: &mut u32) -> Vec<f32> {
    (0..len)
        .map(|_| {
            *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let unit = f32::from(u16::try_from(*seed >> 16).unwrap()) / f32::from(u16::MAX);
            unit - 0.5
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Microphone that streams silence or noise and counts live tracks
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    live: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    loud: Arc<AtomicBool>,
    denied: Arc<AtomicBool>,
}

impl FakeMicrophone {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks opened and not yet stopped
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total number of opens
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Switch between speech-like noise and silence
    pub fn set_loud(&self, loud: bool) {
        self.loud.store(loud, Ordering::SeqCst);
    }

    /// Make every open fail as if the user refused access
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

struct FakeTracks {
    live: Arc<AtomicUsize>,
    stop: CancellationToken,
    stopped: bool,
}

impl MediaTracks for FakeTracks {
    fn stop_all(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stop.cancel();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn live_count(&self) -> usize {
        usize::from(!self.stopped)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<OpenCapture> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(kaeva_voice::Error::PermissionDenied("NotAllowedError".to_string()));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);

        let (tx, frames) = mpsc::channel(64);
        let stop = CancellationToken::new();
        let loud = Arc::clone(&self.loud);
        let frame_len = usize::try_from(constraints.sample_rate / 100).unwrap_or(160);
        let token = stop.clone();

        tokio::spawn(async move {
            let mut seed = 7u32;
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = if loud.load(Ordering::SeqCst) {
                            noise(frame_len, &mut seed)
                        } else {
                            vec![0.0; frame_len]
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(OpenCapture {
            frames,
            tracks: Box::new(FakeTracks {
                live: Arc::clone(&self.live),
                stop,
                stopped: false,
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Speech recognizer
// ---------------------------------------------------------------------------

/// Recognizer whose transcripts are injected by the test
#[derive(Clone, Default)]
pub struct FakeRecognizer {
    current: Arc<Mutex<Option<mpsc::Sender<RecognitionEvent>>>>,
    starts: Arc<AtomicUsize>,
    denied: Arc<AtomicBool>,
}

impl FakeRecognizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recognition streams opened
    #[must_use]
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Refuse to start, as when speech permission is missing
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    /// Deliver an event on the open stream, waiting for one to exist
    pub async fn emit(&self, event: RecognitionEvent) {
        assert!(
            eventually(|| self.current.lock().unwrap().is_some()).await,
            "recognition stream never started"
        );
        let tx = self.current.lock().unwrap().clone().unwrap();
        tx.send(event).await.expect("recognition stream closed");
    }

    /// Deliver a final transcript
    pub async fn say(&self, text: &str) {
        self.emit(RecognitionEvent::Transcript {
            text: text.to_string(),
            is_final: true,
        })
        .await;
    }

    /// Close the open stream so the detector has to restart it
    pub fn end_stream(&self) {
        self.current.lock().unwrap().take();
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(kaeva_voice::Error::PermissionDenied("not-allowed".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(16);
        *self.current.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Agent channel
// ---------------------------------------------------------------------------

/// Something the engine sent to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Started(AgentType),
    Context(String),
    ContextualUpdate(String),
    ToolResult { id: String, result: ToolResult },
    End,
}

/// Agent channel that records outbound traffic
#[derive(Clone)]
pub struct RecordingAgent {
    events: Arc<Mutex<Option<mpsc::Sender<AgentEvent>>>>,
    outbound: Arc<Mutex<Vec<Outbound>>>,
}

impl Default for RecordingAgent {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(None)),
            outbound: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl RecordingAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far
    #[must_use]
    pub fn outbound(&self) -> Vec<Outbound> {
        self.outbound.lock().unwrap().clone()
    }

    /// Tool results in the order they were sent
    #[must_use]
    pub fn tool_results(&self) -> Vec<(String, ToolResult)> {
        self.outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::ToolResult { id, result } => Some((id, result)),
                _ => None,
            })
            .collect()
    }

    /// Send an event as the agent, waiting for the conversation to open
    pub async fn send(&self, event: AgentEvent) {
        assert!(
            eventually(|| self.events.lock().unwrap().is_some()).await,
            "conversation never started"
        );
        let tx = self.events.lock().unwrap().clone().unwrap();
        tx.send(event).await.expect("agent events closed");
    }

    /// Drop the event stream, as when the socket closes
    pub fn disconnect(&self) {
        self.events.lock().unwrap().take();
    }

    fn record(&self, message: Outbound) {
        self.outbound.lock().unwrap().push(message);
    }
}

#[async_trait]
impl AgentChannel for RecordingAgent {
    async fn start(&self, agent_type: AgentType) -> Result<AgentConnection> {
        let (tx, events) = mpsc::channel(32);
        *self.events.lock().unwrap() = Some(tx);
        self.record(Outbound::Started(agent_type));
        Ok(AgentConnection {
            conversation_id: "conv-test".to_string(),
            events,
        })
    }

    async fn send_context(&self, context: &str) -> Result<()> {
        self.record(Outbound::Context(context.to_string()));
        Ok(())
    }

    async fn send_contextual_update(&self, text: &str) -> Result<()> {
        self.record(Outbound::ContextualUpdate(text.to_string()));
        Ok(())
    }

    async fn send_tool_result(&self, invocation_id: &str, result: &ToolResult) -> Result<()> {
        self.record(Outbound::ToolResult {
            id: invocation_id.to_string(),
            result: result.clone(),
        });
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        self.record(Outbound::End);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio output
// ---------------------------------------------------------------------------

/// Sink that finishes immediately
#[derive(Debug, Default)]
pub struct InstantSink {
    pub played: AtomicUsize,
}

#[async_trait]
impl AudioSink for InstantSink {
    async fn play(&self, _: Vec<f32>, _: u32, _: CancellationToken) -> Result<()> {
        self.played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink that plays until cancelled
#[derive(Debug, Default)]
pub struct HoldingSink {
    pub started: AtomicUsize,
    pub cancelled: AtomicUsize,
}

#[async_trait]
impl AudioSink for HoldingSink {
    async fn play(&self, _: Vec<f32>, _: u32, cancel: CancellationToken) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
