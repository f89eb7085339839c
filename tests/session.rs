//! Conversation session integration tests
//!
//! Drives a full controller against fake capabilities: wake word, context
//! hand-off, tool calls, barge-in and teardown.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::NaiveDate;
use kaeva_voice::agent::{AgentEvent, Speaker};
use kaeva_voice::context::{ChangeKind, InventoryChange};
use kaeva_voice::db::NewInventoryItem;
use kaeva_voice::logger::{DebugFlag, LogCategory, VoiceSessionLogger};
use kaeva_voice::voice::{AudioChunk, AudioSink, CaptureOwner, MicrophoneArbiter, MonitorConfig};
use kaeva_voice::{
    AgentType, Config, DataStore, SessionComponents, SessionController, SessionEvent,
    SessionHandle, SessionState, SqliteStore, ToolInvocation,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

mod common;
use common::{
    FakeMicrophone, FakeRecognizer, HoldingSink, InstantSink, Outbound, RecordingAgent, eventually,
    setup_store,
};

const USER: &str = "user-1";

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.wake.restart_delay = Duration::from_millis(20);
    config.monitor = MonitorConfig {
        silence_window: Duration::from_millis(300),
        ..MonitorConfig::default()
    };
    config.debug.set(true);
    config
}

struct Harness {
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Receiver<SessionState>,
    arbiter: MicrophoneArbiter,
    logger: VoiceSessionLogger,
    mic: FakeMicrophone,
    recognizer: FakeRecognizer,
    agent: RecordingAgent,
    store: Arc<SqliteStore>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(agent_type: AgentType, sink: Arc<dyn AudioSink>) -> Self {
        Self::start_with(agent_type, sink, setup_store())
    }

    fn start_with(agent_type: AgentType, sink: Arc<dyn AudioSink>, store: Arc<SqliteStore>) -> Self {
        let mic = FakeMicrophone::new();
        let recognizer = FakeRecognizer::new();
        let agent = RecordingAgent::new();
        let logger = VoiceSessionLogger::new(DebugFlag::new(true), 500);

        let components = SessionComponents {
            microphone: Arc::new(mic.clone()),
            recognizer: Arc::new(recognizer.clone()),
            agent: Arc::new(agent.clone()),
            store: store.clone(),
            sink,
        };

        let (controller, handle, events) =
            SessionController::new(&test_config(), USER, agent_type, components, logger.clone());
        let controller = controller.with_date(today());
        let arbiter = controller.arbiter();
        let state = handle.watch_state();
        let task = tokio::spawn(controller.run());

        Self {
            handle,
            events,
            state,
            arbiter,
            logger,
            mic,
            recognizer,
            agent,
            store,
            task,
        }
    }

    async fn wait_for(&mut self, want: SessionState) {
        let reached = tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(|s| *s == want))
            .await
            .map(|r| r.is_ok());
        match reached {
            Ok(true) => {}
            Ok(false) => panic!("controller dropped while waiting for {want:?}"),
            Err(_) => panic!("timed out waiting for {want:?}, at {:?}", *self.state.borrow()),
        }
    }

    /// Collect events until one matches `pred`
    async fn next_matching(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("event stream closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    async fn tool(&self, id: &str, name: &str, parameters: serde_json::Value) {
        self.agent
            .send(AgentEvent::ToolCall(ToolInvocation::new(id, name, parameters)))
            .await;
    }

    async fn wait_tool_results(&self, n: usize) -> Vec<(String, kaeva_voice::ToolResult)> {
        assert!(
            eventually(|| self.agent.tool_results().len() >= n).await,
            "only {} tool results",
            self.agent.tool_results().len()
        );
        self.agent.tool_results()
    }
}

fn pcm_chunk(samples: usize) -> AudioChunk {
    let pcm: Vec<u8> = (0..samples).flat_map(|i| i16::try_from(i % 1000).unwrap().to_le_bytes()).collect();
    AudioChunk::new(STANDARD.encode(pcm), "audio/pcm;rate=24000")
}

#[tokio::test]
async fn test_wake_word_to_teardown() {
    let store = setup_store();
    let mut milk = NewInventoryItem::named("Milk");
    milk.fill_level = Some(10);
    store.add_inventory_item(USER, milk).unwrap();

    let mut h = Harness::start_with(AgentType::Onboarding, Arc::new(InstantSink::default()), store);
    h.wait_for(SessionState::ListeningForWakeWord).await;
    assert_eq!(h.arbiter.holder(), Some(CaptureOwner::WakeWord));

    h.recognizer.say("hey kaeva").await;
    let activated = h.next_matching(|e| matches!(e, SessionEvent::Activated(_))).await;
    let SessionEvent::Activated(activation) = activated else { unreachable!() };
    assert_eq!(activation.matched_keyword, "hey kaeva");

    h.wait_for(SessionState::Active).await;
    assert!(eventually(|| h.arbiter.holder() == Some(CaptureOwner::VoiceActivity)).await);

    // Full context goes out exactly once, right after the agent starts
    let outbound = h.agent.outbound();
    assert_eq!(outbound[0], Outbound::Started(AgentType::Onboarding));
    let Outbound::Context(context) = &outbound[1] else {
        panic!("expected context, got {:?}", outbound[1]);
    };
    assert!(context.contains("LOW STOCK: Milk (10%)"), "{context}");

    h.tool("t1", "updateProfile", json!({ "field": "dietaryValues", "value": ["vegan"] }))
        .await;
    let results = h.wait_tool_results(1).await;
    assert_eq!(results[0].0, "t1");
    assert_eq!(results[0].1.to_string(), "Updated dietaryValues");

    let profile = h.store.snapshot(USER, today()).await.unwrap().profile;
    assert_eq!(profile.dietary_values, vec!["vegan".to_string()]);
    assert!(eventually(|| {
        h.agent
            .outbound()
            .iter()
            .any(|o| matches!(o, Outbound::ContextualUpdate(t) if t.contains("diet vegan")))
    })
    .await);

    h.tool("t2", "endConversation", json!({ "reason": "done" })).await;
    h.wait_for(SessionState::Ended).await;
    let ended = h.next_matching(|e| matches!(e, SessionEvent::Ended { .. })).await;
    assert_eq!(ended, SessionEvent::Ended { reason: "done".to_string() });

    h.task.await.unwrap();

    let outbound = h.agent.outbound();
    let contexts = outbound.iter().filter(|o| matches!(o, Outbound::Context(_))).count();
    assert_eq!(contexts, 1);
    assert_eq!(
        h.agent.tool_results()[1],
        ("t2".to_string(), kaeva_voice::ToolResult::success("Conversation ended"))
    );
    assert_eq!(outbound.last(), Some(&Outbound::End));

    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(h.arbiter.holder(), None);
}

#[tokio::test]
async fn test_tool_results_keep_arrival_order() {
    let mut h = Harness::start(AgentType::Assistant, Arc::new(InstantSink::default()));
    h.wait_for(SessionState::ListeningForWakeWord).await;
    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    h.tool("a", "addToShoppingList", json!({ "items": ["eggs", "bread"] })).await;
    h.tool("b", "flyToMoon", json!({})).await;
    h.tool("c", "navigateTo", json!({ "page": "pantry" })).await;
    h.tool("d", "updateProfile", json!({ "field": "favouriteColour", "value": "blue" }))
        .await;

    let results = h.wait_tool_results(4).await;
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c", "d"]);
    assert!(results[0].1.is_success());
    assert_eq!(results[1].1.to_string(), "ERROR: Unknown tool: flyToMoon");
    assert_eq!(results[2].1.to_string(), "Navigated to pantry");
    assert_eq!(results[3].1.to_string(), "ERROR: Unknown field: favouriteColour");

    let navigate = h.next_matching(|e| matches!(e, SessionEvent::Navigate(_))).await;
    assert_eq!(navigate, SessionEvent::Navigate("pantry".to_string()));

    assert!(eventually(|| {
        h.agent
            .outbound()
            .iter()
            .any(|o| matches!(o, Outbound::ContextualUpdate(t) if t == "CART UPDATE: 2 items (eggs, bread)"))
    })
    .await);

    h.handle.end("bye").unwrap();
    h.wait_for(SessionState::Ended).await;
    h.task.await.unwrap();
    assert_eq!(h.mic.live_tracks(), 0);
}

#[tokio::test]
async fn test_agent_audio_then_barge_in() {
    let sink = Arc::new(HoldingSink::default());
    let mut h = Harness::start(AgentType::Assistant, sink.clone());
    h.wait_for(SessionState::ListeningForWakeWord).await;
    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    h.agent
        .send(AgentEvent::Transcript {
            speaker: Speaker::Agent,
            text: "Hi there".to_string(),
        })
        .await;
    h.agent.send(AgentEvent::Audio(pcm_chunk(2400))).await;
    h.wait_for(SessionState::AgentSpeaking).await;
    assert!(eventually(|| h.arbiter.holder() == Some(CaptureOwner::BargeIn)).await);
    assert!(eventually(|| sink.started.load(Ordering::SeqCst) == 1).await);

    // User talks over the agent
    h.mic.set_loud(true);
    h.next_matching(|e| *e == SessionEvent::BargeIn).await;
    h.wait_for(SessionState::UserSpeaking).await;
    assert!(eventually(|| sink.cancelled.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| h.arbiter.holder() == Some(CaptureOwner::VoiceActivity)).await);

    // Late audio from the interrupted utterance does not take the floor back
    h.agent.send(AgentEvent::Audio(pcm_chunk(2400))).await;
    assert!(eventually(|| {
        h.logger
            .by_category(LogCategory::Audio)
            .iter()
            .any(|e| e.event == "chunk_dropped")
    })
    .await);
    assert_eq!(*h.state.borrow(), SessionState::UserSpeaking);
    assert_eq!(sink.started.load(Ordering::SeqCst), 1);

    // ...then stops, and the turn passes back
    h.mic.set_loud(false);
    h.next_matching(|e| *e == SessionEvent::Silence).await;
    h.wait_for(SessionState::Active).await;

    // The agent's next turn plays again
    h.agent.send(AgentEvent::Audio(pcm_chunk(2400))).await;
    h.wait_for(SessionState::AgentSpeaking).await;
    assert!(eventually(|| sink.started.load(Ordering::SeqCst) == 2).await);

    h.handle.end("bye").unwrap();
    h.wait_for(SessionState::Ended).await;
    h.task.await.unwrap();

    assert_eq!(h.mic.live_tracks(), 0);
    assert_eq!(h.arbiter.holder(), None);
    assert!(!h.logger.by_category(LogCategory::Audio).is_empty());
}

#[tokio::test]
async fn test_completed_playback_returns_turn() {
    let sink = Arc::new(InstantSink::default());
    let mut h = Harness::start(AgentType::Assistant, sink.clone());
    h.wait_for(SessionState::ListeningForWakeWord).await;
    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    h.agent.send(AgentEvent::Audio(pcm_chunk(240))).await;
    h.agent.send(AgentEvent::Audio(pcm_chunk(240))).await;
    h.next_matching(|e| *e == SessionEvent::StateChanged(SessionState::AgentSpeaking))
        .await;
    h.next_matching(|e| *e == SessionEvent::StateChanged(SessionState::Active))
        .await;
    assert!(eventually(|| sink.played.load(Ordering::SeqCst) == 2).await);

    h.handle.end("bye").unwrap();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_bad_audio_is_reported_and_skipped() {
    let mut h = Harness::start(AgentType::Assistant, Arc::new(InstantSink::default()));
    h.wait_for(SessionState::ListeningForWakeWord).await;
    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    h.agent
        .send(AgentEvent::Audio(AudioChunk::new("%%%", "audio/pcm")))
        .await;
    h.next_matching(|e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(*h.state.borrow(), SessionState::Active);

    // A rate too large for the WAV header is an error, not a crash
    h.agent
        .send(AgentEvent::Audio(AudioChunk::new("AAA=", "audio/pcm;rate=3000000000")))
        .await;
    let error = h.next_matching(|e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(error, SessionEvent::Error(ref msg) if msg.contains("sample rate")), "{error:?}");
    assert_eq!(*h.state.borrow(), SessionState::Active);
    assert!(!h.task.is_finished());

    h.handle.end("bye").unwrap();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_agent_disconnect_ends_session() {
    let mut h = Harness::start(AgentType::Assistant, Arc::new(InstantSink::default()));
    h.wait_for(SessionState::ListeningForWakeWord).await;
    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    h.agent
        .send(AgentEvent::Disconnected {
            reason: Some("socket closed".to_string()),
        })
        .await;
    let ended = h.next_matching(|e| matches!(e, SessionEvent::Ended { .. })).await;
    assert_eq!(ended, SessionEvent::Ended { reason: "socket closed".to_string() });
    h.task.await.unwrap();

    // The agent ended the call itself, so it is not told again
    assert!(!h.agent.outbound().contains(&Outbound::End));
    assert_eq!(h.mic.live_tracks(), 0);
}

#[tokio::test]
async fn test_inventory_changes_reach_agent_only_while_live() {
    let store = setup_store();
    let mut h = Harness::start_with(AgentType::Assistant, Arc::new(InstantSink::default()), store.clone());
    h.wait_for(SessionState::ListeningForWakeWord).await;

    // Nobody to tell yet
    let eggs = store.add_inventory_item(USER, NewInventoryItem::named("Eggs")).unwrap();
    h.handle.inventory_changed(&InventoryChange {
        kind: ChangeKind::Insert,
        item: eggs,
    });
    assert!(eventually(|| {
        h.logger
            .by_category(LogCategory::Context)
            .iter()
            .any(|e| e.event == "update_dropped" && e.data["text"] == "INVENTORY UPDATE: added Eggs")
    })
    .await);

    h.handle.activate().unwrap();
    h.wait_for(SessionState::Active).await;

    let milk = store.add_inventory_item(USER, NewInventoryItem::named("Milk")).unwrap();
    let milk = store.set_fill_level(&milk.id, 5).unwrap();
    h.handle.inventory_changed(&InventoryChange {
        kind: ChangeKind::Update,
        item: milk.clone(),
    });
    h.handle.inventory_changed(&InventoryChange {
        kind: ChangeKind::Delete,
        item: milk,
    });

    let updates = || -> Vec<String> {
        h.agent
            .outbound()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::ContextualUpdate(text) => Some(text),
                _ => None,
            })
            .collect()
    };
    assert!(eventually(|| updates().len() >= 2).await);
    assert_eq!(
        updates(),
        ["INVENTORY UPDATE: updated Milk (low stock)", "INVENTORY UPDATE: removed Milk"]
    );

    h.handle.end("bye").unwrap();
    h.task.await.unwrap();
}

#[tokio::test]
async fn test_end_before_activation() {
    let mut h = Harness::start(AgentType::Assistant, Arc::new(InstantSink::default()));
    h.wait_for(SessionState::ListeningForWakeWord).await;

    h.handle.end("cancelled").unwrap();
    h.wait_for(SessionState::Ended).await;
    h.task.await.unwrap();

    assert!(h.agent.outbound().is_empty());
    assert_eq!(h.arbiter.holder(), None);
    assert!(h.handle.activate().is_err());
}
