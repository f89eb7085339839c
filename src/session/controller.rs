//! Session controller event loop

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use super::{AgentType, Command, ConversationSession, SessionEvent, SessionHandle, SessionState};
use crate::agent::{AgentChannel, AgentEvent};
use crate::config::Config;
use crate::context::{ContextUpdate, serialize_full};
use crate::logger::VoiceSessionLogger;
use crate::store::DataStore;
use crate::tools::{ToolDispatcher, ToolInvocation};
use crate::voice::{
    ActivationEvent, AudioChunk, AudioPlayer, AudioSink, BargeInDetector, BargeInEvent, Microphone,
    MicrophoneArbiter, MonitorEvent, PlayableAudio, PlaybackHandle, PlaybackOutcome,
    SpeechRecognizer, VoiceActivityMonitor, WakeWordDetector, decode_with_default,
};
use crate::{Error, Result};

/// External capabilities a session runs on
#[derive(Clone)]
pub struct SessionComponents {
    pub microphone: Arc<dyn Microphone>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub agent: Arc<dyn AgentChannel>,
    pub store: Arc<dyn DataStore>,
    pub sink: Arc<dyn AudioSink>,
}

/// Which component currently holds the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    None,
    WakeWord,
    VoiceActivity,
    BargeIn,
}

/// Drives one conversation through its states
///
/// Captures are strictly sequenced: the previous one is stopped before the
/// next starts. Tool calls are answered one at a time in arrival order.
pub struct SessionController {
    user_id: String,
    agent_type: AgentType,
    volume: f32,
    default_sample_rate: u32,
    as_of: Option<NaiveDate>,

    logger: VoiceSessionLogger,
    agent: Arc<dyn AgentChannel>,
    store: Arc<dyn DataStore>,
    dispatcher: ToolDispatcher,
    player: AudioPlayer,
    arbiter: MicrophoneArbiter,

    wake_word: WakeWordDetector,
    voice_activity: VoiceActivityMonitor,
    barge_in: BargeInDetector,
    capture: Capture,

    activations: mpsc::UnboundedReceiver<ActivationEvent>,
    monitor_events: mpsc::UnboundedReceiver<MonitorEvent>,
    barge_ins: mpsc::UnboundedReceiver<BargeInEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    context_updates: mpsc::UnboundedReceiver<ContextUpdate>,
    agent_events: Option<mpsc::Receiver<AgentEvent>>,

    playing: Option<PlaybackHandle>,
    queue: VecDeque<PlayableAudio>,
    /// Set by a barge-in; audio from the interrupted turn is dropped until
    /// the user falls silent
    discard_agent_audio: bool,

    session: Option<ConversationSession>,
    state: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("user_id", &self.user_id)
            .field("agent_type", &self.agent_type)
            .field("state", &*self.state.borrow())
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Build a controller, its handle, and the event stream
    #[must_use]
    pub fn new(
        config: &Config,
        user_id: impl Into<String>,
        agent_type: AgentType,
        components: SessionComponents,
        logger: VoiceSessionLogger,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let user_id = user_id.into();
        let arbiter = MicrophoneArbiter::new();

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (context_tx, context_updates) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Idle);
        let (events, events_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            commands: command_tx,
            context: context_tx.clone(),
            state: state_rx,
        };

        let (activation_tx, activations) = mpsc::unbounded_channel();
        let wake_word = WakeWordDetector::new(
            components.recognizer,
            arbiter.clone(),
            config.wake.clone(),
            activation_tx,
        );

        let (monitor_tx, monitor_events) = mpsc::unbounded_channel();
        let voice_activity = VoiceActivityMonitor::new(
            Arc::clone(&components.microphone),
            arbiter.clone(),
            config.monitor.clone(),
            Arc::new(monitor_tx),
        );

        let (barge_tx, barge_ins) = mpsc::unbounded_channel();
        let barge_in = BargeInDetector::new(
            components.microphone,
            arbiter.clone(),
            config.monitor.clone(),
            config.barge_in_threshold,
            barge_tx,
        );

        let dispatcher = ToolDispatcher::new(
            user_id.clone(),
            Arc::clone(&components.store),
            Arc::new(handle.clone()),
            logger.clone(),
        )
        .with_updates(context_tx);

        let controller = Self {
            user_id,
            agent_type,
            volume: config.playback.volume,
            default_sample_rate: config.playback.default_sample_rate,
            as_of: None,
            logger,
            agent: components.agent,
            store: components.store,
            dispatcher,
            player: AudioPlayer::new(components.sink),
            arbiter,
            wake_word,
            voice_activity,
            barge_in,
            capture: Capture::None,
            activations,
            monitor_events,
            barge_ins,
            commands,
            context_updates,
            agent_events: None,
            playing: None,
            queue: VecDeque::new(),
            discard_agent_audio: false,
            session: None,
            state,
            events,
        };

        (controller, handle, events_rx)
    }

    /// Pin the date used for context snapshots (defaults to today, UTC)
    #[must_use]
    pub fn with_date(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self.dispatcher = self.dispatcher.with_date(as_of);
        self
    }

    /// Shared microphone arbiter, for diagnostics
    #[must_use]
    pub fn arbiter(&self) -> MicrophoneArbiter {
        self.arbiter.clone()
    }

    /// Player used for agent audio
    #[must_use]
    pub fn player(&self) -> AudioPlayer {
        self.player.clone()
    }

    /// Listen for the wake word, hold one conversation, and return once it ends
    ///
    /// Component failures are reported as [`SessionEvent::Error`]; the
    /// session either carries on or ends cleanly.
    pub async fn run(mut self) {
        self.listen().await;

        while *self.state.borrow() != SessionState::Ended {
            tokio::select! {
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(activation) = self.activations.recv() => self.activate(Some(activation)).await,
                event = next_agent_event(&mut self.agent_events) => self.on_agent_event(event).await,
                outcome = wait_playback(&mut self.playing) => self.on_playback_finished(outcome),
                Some(event) = self.barge_ins.recv() => self.on_barge_in(event),
                Some(event) = self.monitor_events.recv() => self.on_monitor_event(event),
                Some(update) = self.context_updates.recv() => self.forward_context(update).await,
            }

            // Captures switch outside the select so stop/start never race
            self.settle_capture().await;
        }

        tracing::info!(user_id = %self.user_id, "session controller finished");
    }

    async fn listen(&mut self) {
        self.switch_capture(Capture::WakeWord).await;
        if self.capture == Capture::WakeWord && self.wake_word.is_running() {
            self.set_state(SessionState::ListeningForWakeWord);
        } else {
            self.set_state(SessionState::Idle);
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Activate => self.activate(None).await,
            Command::End { reason } => self.end(&reason, true).await,
            Command::Navigate(page) => {
                self.logger.session("navigate", json!({ "page": page }));
                self.emit(SessionEvent::Navigate(page));
            }
        }
    }

    async fn activate(&mut self, activation: Option<ActivationEvent>) {
        let current = *self.state.borrow();
        if current.is_live() || current == SessionState::Ended {
            tracing::debug!(state = ?current, "ignoring activation");
            return;
        }

        if let Some(activation) = activation {
            tracing::info!(
                keyword = %activation.matched_keyword,
                score = activation.similarity_score,
                "wake word activated session"
            );
            self.emit(SessionEvent::Activated(activation));
        }

        // Release the microphone before the agent connects
        self.switch_capture(Capture::None).await;

        let connection = match self.agent.start(self.agent_type).await {
            Ok(connection) => connection,
            Err(e) => {
                self.report_error("agent_start_failed", &e);
                self.listen().await;
                return;
            }
        };

        let conversation_id = connection.conversation_id;
        self.logger.set_conversation(&conversation_id, self.agent_type);
        self.logger.session(
            "started",
            json!({ "conversationId": conversation_id, "agentType": self.agent_type }),
        );
        self.logger.connection("connected", json!({ "userId": self.user_id }));
        tracing::info!(conversation_id = %conversation_id, agent_type = %self.agent_type, "conversation started");

        self.session = Some(ConversationSession {
            conversation_id,
            agent_type: self.agent_type,
            started_at: Utc::now(),
            state: SessionState::Active,
        });
        self.agent_events = Some(connection.events);

        self.send_full_context().await;
        self.set_state(SessionState::Active);
        self.switch_capture(Capture::VoiceActivity).await;
    }

    async fn send_full_context(&self) {
        let as_of = self.as_of.unwrap_or_else(|| Utc::now().date_naive());
        let context = match self.store.snapshot(&self.user_id, as_of).await {
            Ok(snapshot) => serialize_full(&snapshot),
            Err(e) => {
                self.report_error("snapshot_failed", &e);
                return;
            }
        };

        match self.agent.send_context(&context).await {
            Ok(()) => self.logger.context("full_sent", json!({ "chars": context.len() })),
            Err(e) => self.report_error("context_send_failed", &e),
        }
    }

    async fn on_agent_event(&mut self, event: Option<AgentEvent>) {
        match event {
            Some(AgentEvent::Transcript { speaker, text }) => {
                self.logger.message("transcript", json!({ "speaker": speaker, "text": text }));
                self.emit(SessionEvent::Transcript { speaker, text });
            }
            Some(AgentEvent::Audio(chunk)) => self.on_agent_audio(&chunk),
            Some(AgentEvent::ToolCall(invocation)) => self.on_tool_call(&invocation).await,
            Some(AgentEvent::Interrupted) => {
                self.logger.audio("agent_interrupted", json!({}));
                self.stop_playback();
                self.finish_agent_turn();
            }
            Some(AgentEvent::Disconnected { reason }) => {
                let reason = reason.unwrap_or_else(|| "agent disconnected".to_string());
                self.logger.connection("disconnected", json!({ "reason": reason }));
                self.end(&reason, false).await;
            }
            None => {
                self.logger.connection("closed", json!({}));
                self.end("agent channel closed", false).await;
            }
        }
    }

    fn on_agent_audio(&mut self, chunk: &AudioChunk) {
        if self.discard_agent_audio {
            tracing::trace!("dropping audio from interrupted turn");
            self.logger.audio("chunk_dropped", json!({ "reason": "barge_in" }));
            return;
        }

        let audio = match decode_with_default(chunk, self.default_sample_rate) {
            Ok(audio) => audio,
            Err(e) => {
                self.report_error("audio_decode_failed", &e);
                return;
            }
        };

        self.logger.audio(
            "chunk_received",
            json!({ "bytes": audio.data_len(), "sampleRate": audio.sample_rate }),
        );
        self.queue.push_back(audio);

        if self.playing.is_none() {
            self.play_next();
        }
    }

    /// Start the next queued chunk, skipping any the player rejects
    fn play_next(&mut self) {
        while let Some(audio) = self.queue.pop_front() {
            match self.player.play(&audio, self.volume) {
                Ok(handle) => {
                    self.playing = Some(handle);
                    self.set_state(SessionState::AgentSpeaking);
                    return;
                }
                Err(e) => self.report_error("playback_failed", &e),
            }
        }
        self.finish_agent_turn();
    }

    fn on_playback_finished(&mut self, outcome: Result<PlaybackOutcome>) {
        self.playing = None;
        match outcome {
            Ok(PlaybackOutcome::Completed) => self.play_next(),
            Ok(PlaybackOutcome::Interrupted) => {}
            Err(e) => {
                // End the turn rather than wait on audio that will never finish
                self.report_error("playback_failed", &e);
                self.queue.clear();
                self.finish_agent_turn();
            }
        }
    }

    fn stop_playback(&mut self) {
        self.queue.clear();
        if let Some(handle) = self.playing.take() {
            handle.cancel();
        }
    }

    fn finish_agent_turn(&mut self) {
        if *self.state.borrow() == SessionState::AgentSpeaking {
            self.set_state(SessionState::Active);
        }
    }

    fn on_barge_in(&mut self, event: BargeInEvent) {
        if *self.state.borrow() != SessionState::AgentSpeaking {
            return;
        }
        tracing::debug!(level = event.level, "user barged in");
        self.logger.audio("barge_in", json!({ "level": event.level }));
        self.stop_playback();
        self.discard_agent_audio = true;
        self.emit(SessionEvent::BargeIn);
        self.set_state(SessionState::UserSpeaking);
    }

    fn on_monitor_event(&mut self, event: MonitorEvent) {
        let state = *self.state.borrow();
        match event {
            MonitorEvent::Level(sample) => self.emit(SessionEvent::Level(sample.level)),
            MonitorEvent::SpeechStarted(_) if state == SessionState::Active => {
                self.set_state(SessionState::UserSpeaking);
            }
            MonitorEvent::Silence(silence) if state == SessionState::UserSpeaking => {
                self.logger.audio("silence", json!({ "lastSpeechMs": silence.last_speech_ms }));
                self.discard_agent_audio = false;
                self.emit(SessionEvent::Silence);
                self.set_state(SessionState::Active);
            }
            MonitorEvent::SpeechStarted(_) | MonitorEvent::Silence(_) => {}
        }
    }

    async fn on_tool_call(&mut self, invocation: &ToolInvocation) {
        let result = self.dispatcher.dispatch(invocation).await;
        if let Err(e) = self.agent.send_tool_result(&invocation.id, &result).await {
            self.report_error("tool_result_send_failed", &e);
        }
    }

    async fn forward_context(&self, update: ContextUpdate) {
        if !self.state.borrow().is_live() {
            tracing::debug!("no live conversation, dropping context update");
            self.logger.context("update_dropped", json!({ "text": update.text() }));
            return;
        }
        match self.agent.send_contextual_update(update.text()).await {
            Ok(()) => self.logger.context(
                match update {
                    ContextUpdate::Full(_) => "full_refresh_sent",
                    ContextUpdate::Delta(_) => "delta_sent",
                },
                json!({ "text": update.text() }),
            ),
            Err(e) => self.report_error("context_update_failed", &e),
        }
    }

    async fn end(&mut self, reason: &str, notify_agent: bool) {
        if *self.state.borrow() == SessionState::Ended {
            return;
        }

        self.stop_playback();
        self.switch_capture(Capture::None).await;

        if self.session.is_some() {
            if notify_agent {
                if let Err(e) = self.agent.end().await {
                    self.report_error("agent_end_failed", &e);
                }
            }
            self.agent_events = None;
        }

        self.logger.session("ended", json!({ "reason": reason }));
        tracing::info!(reason, "session ended");
        self.set_state(SessionState::Ended);
        self.logger.clear_conversation();
        self.emit(SessionEvent::Ended {
            reason: reason.to_string(),
        });
    }

    /// Bring the active capture in line with the state
    async fn settle_capture(&mut self) {
        let wanted = match *self.state.borrow() {
            SessionState::AgentSpeaking => Capture::BargeIn,
            SessionState::Active | SessionState::UserSpeaking => Capture::VoiceActivity,
            SessionState::Idle | SessionState::ListeningForWakeWord | SessionState::Ended => return,
        };
        self.switch_capture(wanted).await;
    }

    /// Stop whatever holds the microphone, then start `next`
    async fn switch_capture(&mut self, next: Capture) {
        if self.capture == next {
            return;
        }

        match self.capture {
            Capture::WakeWord => self.wake_word.stop().await,
            Capture::VoiceActivity => self.voice_activity.stop().await,
            Capture::BargeIn => self.barge_in.stop().await,
            Capture::None => {}
        }
        self.capture = Capture::None;

        let started = match next {
            Capture::WakeWord => self.wake_word.start().await,
            Capture::VoiceActivity => self.voice_activity.start().await,
            Capture::BargeIn => self.barge_in.start().await,
            Capture::None => Ok(()),
        };

        match started {
            Ok(()) => {
                self.capture = next;
                tracing::debug!(capture = ?next, "capture switched");
            }
            Err(e) => self.report_error("capture_start_failed", &e),
        }
    }

    fn set_state(&mut self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }
        if let Some(session) = &mut self.session {
            session.state = next;
        }
        self.logger.state("transition", json!({ "from": previous, "to": next }));
        tracing::debug!(from = ?previous, to = ?next, "session state");
        self.emit(SessionEvent::StateChanged(next));
    }

    fn report_error(&self, event: &str, error: &Error) {
        tracing::warn!(event, error = %error, "session error");
        self.logger.error(event, json!({ "error": error.to_string() }));
        self.emit(SessionEvent::Error(error.to_string()));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_agent_event(events: &mut Option<mpsc::Receiver<AgentEvent>>) -> Option<AgentEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_playback(playing: &mut Option<PlaybackHandle>) -> Result<PlaybackOutcome> {
    match playing {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}
