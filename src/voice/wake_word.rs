//! Wake word detection
//!
//! Listens to a continuous speech recognition stream and activates the
//! assistant when a transcript fragment matches one of the configured
//! phrases, either by containment or by edit-distance similarity.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::capture::{CaptureOwner, MicrophoneArbiter};
use crate::{Error, Result};

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeWordConfig {
    /// Candidate phrases (e.g., "hey kaeva")
    pub keywords: Vec<String>,
    /// Minimum similarity in [0, 1] for a fuzzy match
    pub threshold: f32,
    pub enabled: bool,
    /// Re-activation is suppressed for this long after an activation
    pub debounce: Duration,
    /// Delay before restarting a recognition stream that ended
    pub restart_delay: Duration,
    /// Require containment matches to fall on word boundaries
    pub word_boundary: bool,
}

impl Default for WakeWordConfig {
    fn default() -> Self {
        Self {
            keywords: vec!["hey kaeva".to_string(), "kaeva".to_string()],
            threshold: 0.7,
            enabled: true,
            debounce: Duration::from_millis(3000),
            restart_delay: Duration::from_millis(300),
            word_boundary: false,
        }
    }
}

/// Emitted when a wake phrase is heard
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationEvent {
    pub detected_at: DateTime<Utc>,
    pub matched_keyword: String,
    /// 1.0 for containment matches
    pub similarity_score: f32,
    pub transcript: String,
}

/// Observable detector state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WakeWordState {
    /// A recognition stream is currently open
    pub listening: bool,
    /// Terminal error (e.g., permission denied); restarts are disabled
    pub error: Option<String>,
    pub last_activation: Option<ActivationEvent>,
}

/// Recognition stream failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecognitionError {
    /// Permission denied; terminal
    #[error("not-allowed")]
    NotAllowed,
    /// Nothing was heard before the recognizer gave up
    #[error("no-speech")]
    NoSpeech,
    #[error("aborted")]
    Aborted,
    /// The stream lost its backend; it is reopened
    #[error("network: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

impl RecognitionError {
    /// Classify a recognizer error code such as `no-speech` or `not-allowed`
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_lowercase().as_str() {
            "not-allowed" | "service-not-allowed" => Self::NotAllowed,
            "no-speech" => Self::NoSpeech,
            "aborted" => Self::Aborted,
            other if other.starts_with("network") => Self::Network(other.to_string()),
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::NotAllowed)
    }
}

impl From<RecognitionError> for Error {
    fn from(e: RecognitionError) -> Self {
        match e {
            RecognitionError::NotAllowed => Self::PermissionDenied(e.to_string()),
            other => Self::Recognition(other.to_string()),
        }
    }
}

/// Events from a continuous recognition stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Transcript { text: String, is_final: bool },
    Error(RecognitionError),
    /// The stream ended and will not deliver more events
    Ended,
}

/// Continuous speech-to-text capability
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Open a new recognition stream
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if speech access is refused
    async fn start(&self) -> Result<mpsc::Receiver<RecognitionEvent>>;
}

/// Levenshtein edit distance over characters
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Case-insensitive similarity: `1 - distance / max(len)`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f32 / longest as f32
}

/// Lowercase, strip punctuation and collapse whitespace
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A keyword that matched a transcript
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordMatch {
    pub keyword: String,
    pub score: f32,
}

/// Matches transcripts against the configured phrases
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
    threshold: f32,
    word_boundary: bool,
}

impl KeywordMatcher {
    #[must_use]
    pub fn new(keywords: &[String], threshold: f32, word_boundary: bool) -> Self {
        let keywords = keywords
            .iter()
            .map(|k| normalize(k))
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keywords,
            threshold,
            word_boundary,
        }
    }

    #[must_use]
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Best matching keyword, preferring containment over fuzzy matches
    #[must_use]
    pub fn best_match(&self, transcript: &str) -> Option<KeywordMatch> {
        let text = normalize(transcript);
        if text.is_empty() {
            return None;
        }

        let mut best: Option<KeywordMatch> = None;
        for keyword in &self.keywords {
            let score = if self.contains(&text, keyword) {
                1.0
            } else {
                similarity(&text, keyword)
            };

            if score < self.threshold {
                continue;
            }
            // Longer keywords win ties so "hey kaeva" beats "kaeva"
            let better = best.as_ref().is_none_or(|b| {
                score > b.score
                    || ((score - b.score).abs() < f32::EPSILON && keyword.len() > b.keyword.len())
            });
            if better {
                best = Some(KeywordMatch {
                    keyword: keyword.clone(),
                    score,
                });
            }
        }
        best
    }

    fn contains(&self, text: &str, keyword: &str) -> bool {
        if self.word_boundary {
            format!(" {text} ").contains(&format!(" {keyword} "))
        } else {
            text.contains(keyword)
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Debounced wake word detector over a [`SpeechRecognizer`]
pub struct WakeWordDetector {
    recognizer: Arc<dyn SpeechRecognizer>,
    arbiter: MicrophoneArbiter,
    config: WakeWordConfig,
    matcher: KeywordMatcher,
    activations: mpsc::UnboundedSender<ActivationEvent>,
    state: watch::Sender<WakeWordState>,
    running: Mutex<Running>,
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("keywords", &self.matcher.keywords())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl WakeWordDetector {
    /// Create a detector publishing activations on `activations`
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        arbiter: MicrophoneArbiter,
        config: WakeWordConfig,
        activations: mpsc::UnboundedSender<ActivationEvent>,
    ) -> Self {
        let matcher = KeywordMatcher::new(&config.keywords, config.threshold, config.word_boundary);
        tracing::debug!(keywords = ?matcher.keywords(), "wake word detector initialized");

        let (state, _) = watch::channel(WakeWordState::default());
        Self {
            recognizer,
            arbiter,
            config,
            matcher,
            activations,
            state,
            running: Mutex::new(Running {
                cancel: CancellationToken::new(),
                task: None,
            }),
        }
    }

    /// Snapshot of the current state
    #[must_use]
    pub fn state(&self) -> WakeWordState {
        self.state.borrow().clone()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WakeWordState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start listening; restarts automatically until stopped
    ///
    /// No-op when disabled or already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if a previous run was denied, or
    /// [`Error::MicrophoneBusy`] if another component holds the microphone
    #[allow(clippy::unused_async)]
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::debug!("wake word detection disabled");
            return Ok(());
        }
        if let Some(error) = self.state.borrow().error.clone() {
            return Err(Error::PermissionDenied(error));
        }

        let mut running = self.lock();
        if running.task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::warn!("wake word detector already running");
            return Ok(());
        }

        let lease = self.arbiter.acquire(CaptureOwner::WakeWord)?;
        running.cancel = CancellationToken::new();

        let listener = Listener {
            recognizer: Arc::clone(&self.recognizer),
            matcher: self.matcher.clone(),
            debounce: self.config.debounce,
            restart_delay: self.config.restart_delay,
            activations: self.activations.clone(),
            state: self.state.clone(),
            cancel: running.cancel.clone(),
            last_activation: None,
        };
        running.task = Some(tokio::spawn(async move {
            listener.run().await;
            drop(lease);
        }));

        tracing::debug!("wake word detector started");
        Ok(())
    }

    /// Stop listening and release the microphone; idempotent
    pub async fn stop(&self) {
        let task = {
            let mut running = self.lock();
            running.cancel.cancel();
            running.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "wake word task ended abnormally");
            }
            tracing::debug!("wake word detector stopped");
        }
        self.state.send_modify(|s| s.listening = false);
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WakeWordDetector {
    fn drop(&mut self) {
        self.lock().cancel.cancel();
    }
}

struct Listener {
    recognizer: Arc<dyn SpeechRecognizer>,
    matcher: KeywordMatcher,
    debounce: Duration,
    restart_delay: Duration,
    activations: mpsc::UnboundedSender<ActivationEvent>,
    state: watch::Sender<WakeWordState>,
    cancel: CancellationToken,
    last_activation: Option<Instant>,
}

enum StreamEnd {
    Restart,
    Terminal,
    Cancelled,
}

impl Listener {
    async fn run(mut self) {
        loop {
            let end = match self.recognizer.start().await {
                Ok(events) => self.consume(events).await,
                Err(Error::PermissionDenied(reason)) => {
                    self.fail(&reason);
                    StreamEnd::Terminal
                }
                Err(e) => {
                    tracing::debug!(error = %e, "recognition failed to start, retrying");
                    StreamEnd::Restart
                }
            };

            self.state.send_modify(|s| s.listening = false);

            match end {
                StreamEnd::Restart => {}
                StreamEnd::Terminal | StreamEnd::Cancelled => break,
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.restart_delay) => {
                    tracing::debug!("restarting recognition stream");
                }
            }
        }
    }

    async fn consume(&mut self, mut events: mpsc::Receiver<RecognitionEvent>) -> StreamEnd {
        self.state.send_modify(|s| s.listening = true);

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                event = events.recv() => event,
            };

            match event {
                Some(RecognitionEvent::Transcript { text, is_final }) => {
                    tracing::trace!(transcript = %text, is_final, "transcript fragment");
                    self.check(&text);
                }
                Some(RecognitionEvent::Error(e)) => {
                    if let Some(end) = self.on_error(e) {
                        return end;
                    }
                }
                Some(RecognitionEvent::Ended) | None => return StreamEnd::Restart,
            }
        }
    }

    /// Decide whether a stream error ends the stream
    fn on_error(&self, error: RecognitionError) -> Option<StreamEnd> {
        match error {
            RecognitionError::NoSpeech | RecognitionError::Aborted => {
                tracing::trace!(%error, "recognition idle");
                None
            }
            RecognitionError::NotAllowed => {
                self.fail(&error.to_string());
                Some(StreamEnd::Terminal)
            }
            RecognitionError::Network(_) => {
                tracing::warn!(error = %Error::from(error), "recognition stream lost, reopening");
                Some(StreamEnd::Restart)
            }
            RecognitionError::Other(_) => {
                tracing::debug!(error = %Error::from(error), "transient recognition error");
                None
            }
        }
    }

    fn check(&mut self, transcript: &str) {
        let Some(found) = self.matcher.best_match(transcript) else {
            return;
        };

        let now = Instant::now();
        if let Some(last) = self.last_activation {
            if now.duration_since(last) < self.debounce {
                tracing::trace!(keyword = %found.keyword, "activation debounced");
                return;
            }
        }
        self.last_activation = Some(now);

        let event = ActivationEvent {
            detected_at: Utc::now(),
            matched_keyword: found.keyword,
            similarity_score: found.score,
            transcript: transcript.to_string(),
        };
        tracing::info!(
            keyword = %event.matched_keyword,
            score = event.similarity_score,
            "wake word detected"
        );

        self.state
            .send_modify(|s| s.last_activation = Some(event.clone()));
        let _ = self.activations.send(event);
    }

    fn fail(&self, reason: &str) {
        tracing::warn!(reason, "speech recognition not allowed, wake word disabled");
        self.state.send_modify(|s| {
            s.listening = false;
            s.error = Some(reason.to_string());
        });
    }
}
