//! Tool dispatch integration tests
//!
//! Runs tool calls against a real `SQLite` store and checks what the agent
//! would see afterwards.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use kaeva_voice::logger::{DebugFlag, LogCategory, VoiceSessionLogger};
use kaeva_voice::tools::SessionControl;
use kaeva_voice::{ContextUpdate, Result, ToolDispatcher, ToolInvocation, serialize_full};
use serde_json::json;
use tokio::sync::mpsc;

mod common;
use common::setup_store;

const USER: &str = "user-1";

#[derive(Default)]
struct RecordingControl {
    ended: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionControl for RecordingControl {
    async fn end_session(&self, reason: &str) -> Result<()> {
        self.ended.lock().unwrap().push(reason.to_string());
        Ok(())
    }

    fn navigate(&self, _page: &str) {}
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

#[tokio::test]
async fn test_household_write_shows_in_context() {
    let store = setup_store();
    let logger = VoiceSessionLogger::new(DebugFlag::new(true), 100);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = ToolDispatcher::new(USER, store.clone(), Arc::new(RecordingControl::default()), logger.clone())
        .with_updates(tx)
        .with_date(today());

    let household = json!({
        "adults": 2,
        "kids": 1,
        "members": [{ "name": "Sam", "relationship": "son", "age": 7, "allergies": ["peanuts"] }],
        "pets": [{ "name": "Rex", "species": "dog" }]
    });
    let inv = ToolInvocation::new("1", "updateProfile", json!({ "field": "household", "value": household }));
    assert_eq!(dispatcher.dispatch(&inv).await.to_string(), "Updated household");

    let ContextUpdate::Full(text) = rx.try_recv().unwrap() else {
        panic!("expected a full refresh");
    };
    assert!(text.contains("SHIELD: avoid peanuts"), "{text}");
    assert!(text.contains("HOUSEHOLD: 2 adults, 1 kid | members Sam (son, 7) | pets Rex (dog)"), "{text}");
    assert_eq!(text, serialize_full(&store.load_snapshot(USER, today()).unwrap()));

    assert_eq!(logger.by_category(LogCategory::Tool).len(), 2);
}

#[tokio::test]
async fn test_malformed_household_writes_nothing() {
    let store = setup_store();
    let logger = VoiceSessionLogger::new(DebugFlag::new(false), 100);
    let dispatcher = ToolDispatcher::new(USER, store.clone(), Arc::new(RecordingControl::default()), logger);

    let inv = ToolInvocation::new("1", "updateProfile", json!({ "field": "householdAdults", "value": 2 }));
    assert!(dispatcher.dispatch(&inv).await.is_success());

    let bad = json!({ "adults": 4, "pets": [42] });
    let inv = ToolInvocation::new("2", "updateProfile", json!({ "field": "household", "value": bad }));
    let result = dispatcher.dispatch(&inv).await;
    assert!(result.to_string().starts_with("ERROR: Failed to update household"), "{result}");

    let snapshot = store.load_snapshot(USER, today()).unwrap();
    assert_eq!(snapshot.profile.household_adults, 2);
    assert!(snapshot.pets.is_empty());
}

#[tokio::test]
async fn test_members_replace_previous_list() {
    let store = setup_store();
    let logger = VoiceSessionLogger::new(DebugFlag::new(false), 100);
    let dispatcher = ToolDispatcher::new(USER, store.clone(), Arc::new(RecordingControl::default()), logger);

    let first = ToolInvocation::new("1", "updateProfile", json!({ "field": "householdMembers", "value": ["Ana", "Ben"] }));
    assert!(dispatcher.dispatch(&first).await.is_success());
    let second = ToolInvocation::new("2", "updateProfile", json!({ "field": "members", "value": ["Cleo"] }));
    assert!(dispatcher.dispatch(&second).await.is_success());

    let names: Vec<String> = store
        .load_snapshot(USER, today())
        .unwrap()
        .members
        .into_iter()
        .map(|m| m.name)
        .collect();
    assert_eq!(names, ["Cleo"]);
}

#[tokio::test]
async fn test_missing_parameter_is_error_result() {
    let store = setup_store();
    let logger = VoiceSessionLogger::new(DebugFlag::new(false), 100);
    let control = Arc::new(RecordingControl::default());
    let dispatcher = ToolDispatcher::new(USER, store, control.clone(), logger);

    let inv = ToolInvocation::new("1", "updateProfile", json!({ "value": "Alex" }));
    let result = dispatcher.dispatch(&inv).await;
    assert!(!result.is_success());
    assert!(result.to_string().contains("field"));

    let inv = ToolInvocation::new("2", "addToShoppingList", json!({ "items": [] }));
    assert_eq!(dispatcher.dispatch(&inv).await.to_string(), "ERROR: No items given");

    let inv = ToolInvocation::new("3", "completeConversation", json!({}));
    assert_eq!(dispatcher.dispatch(&inv).await.to_string(), "Conversation completed");
    assert_eq!(*control.ended.lock().unwrap(), vec!["completed".to_string()]);
}
