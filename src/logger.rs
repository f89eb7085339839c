//! Session-scoped diagnostic log
//!
//! A capped, append-only ring of structured entries for one conversation at a
//! time. The logger is inert unless the shared [`DebugFlag`] is set; the flag
//! is read on every call so it can be flipped while a session is running.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Result;
use crate::config::Config;
use crate::session::AgentType;

/// Default number of entries kept before the oldest are dropped
pub const DEFAULT_CAPACITY: usize = 500;

/// Shared, externally settable debug switch
#[derive(Debug, Clone, Default)]
pub struct DebugFlag(Arc<AtomicBool>);

impl DebugFlag {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::Relaxed);
    }
}

/// Category tag for a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Session,
    Connection,
    Audio,
    Message,
    Tool,
    Context,
    State,
    Error,
}

impl LogCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Connection => "connection",
            Self::Audio => "audio",
            Self::Message => "message",
            Self::Tool => "tool",
            Self::Context => "context",
            Self::State => "state",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub event: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
}

#[derive(Debug, Default)]
struct LoggerState {
    entries: VecDeque<LogEntry>,
    conversation_id: Option<String>,
    agent_type: Option<AgentType>,
}

/// Ring-buffered logger for a single voice conversation
///
/// Cloning yields another handle onto the same buffer.
#[derive(Debug, Clone)]
pub struct VoiceSessionLogger {
    debug: DebugFlag,
    capacity: usize,
    state: Arc<Mutex<LoggerState>>,
}

impl VoiceSessionLogger {
    /// Create a logger gated by `debug`, keeping at most `capacity` entries
    #[must_use]
    pub fn new(debug: DebugFlag, capacity: usize) -> Self {
        Self {
            debug,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(LoggerState::default())),
        }
    }

    /// Logger sharing the configured debug flag and capacity
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.debug.clone(), config.log_capacity)
    }

    /// The debug flag this logger reads
    #[must_use]
    pub const fn debug_flag(&self) -> &DebugFlag {
        &self.debug
    }

    /// Tag subsequent entries with a conversation
    pub fn set_conversation(&self, conversation_id: &str, agent_type: AgentType) {
        let mut state = self.lock();
        state.conversation_id = Some(conversation_id.to_string());
        state.agent_type = Some(agent_type);
    }

    /// Stop tagging entries with the current conversation
    pub fn clear_conversation(&self) {
        let mut state = self.lock();
        state.conversation_id = None;
        state.agent_type = None;
    }

    /// Record an entry; no-op while the debug flag is off
    pub fn log(&self, category: LogCategory, event: &str, data: serde_json::Value) {
        if !self.debug.is_enabled() {
            return;
        }

        let mut state = self.lock();
        let entry = LogEntry {
            timestamp: Utc::now(),
            category,
            event: event.to_string(),
            data,
            conversation_id: state.conversation_id.clone(),
            agent_type: state.agent_type,
        };

        tracing::debug!(
            target: "kaeva_voice::session_log",
            category = %entry.category,
            conversation_id = entry.conversation_id.as_deref().unwrap_or("-"),
            data = %entry.data,
            "{}",
            entry.event
        );

        if state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(entry);
    }

    pub fn session(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Session, event, data);
    }

    pub fn connection(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Connection, event, data);
    }

    pub fn audio(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Audio, event, data);
    }

    pub fn message(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Message, event, data);
    }

    pub fn tool(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Tool, event, data);
    }

    pub fn context(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Context, event, data);
    }

    pub fn state(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::State, event, data);
    }

    pub fn error(&self, event: &str, data: serde_json::Value) {
        self.log(LogCategory::Error, event, data);
    }

    /// All buffered entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Entries with the given category
    #[must_use]
    pub fn by_category(&self, category: LogCategory) -> Vec<LogEntry> {
        self.filtered(|e| e.category == category)
    }

    /// Entries recorded while the given conversation was active
    #[must_use]
    pub fn by_conversation(&self, conversation_id: &str) -> Vec<LogEntry> {
        self.filtered(|e| e.conversation_id.as_deref() == Some(conversation_id))
    }

    /// The most recent `n` error entries, oldest first
    #[must_use]
    pub fn recent_errors(&self, n: usize) -> Vec<LogEntry> {
        let errors = self.by_category(LogCategory::Error);
        let skip = errors.len().saturating_sub(n);
        errors.into_iter().skip(skip).collect()
    }

    /// Drop every buffered entry
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Export the whole buffer as pretty JSON
    ///
    /// # Errors
    ///
    /// Returns error if an entry payload cannot be serialized
    pub fn export_json(&self) -> Result<String> {
        let state = self.lock();
        let export = serde_json::json!({
            "exportedAt": Utc::now().to_rfc3339(),
            "conversationId": state.conversation_id,
            "agentType": state.agent_type,
            "entries": state.entries,
        });
        Ok(serde_json::to_string_pretty(&export)?)
    }

    fn filtered(&self, predicate: impl Fn(&LogEntry) -> bool) -> Vec<LogEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn enabled(capacity: usize) -> VoiceSessionLogger {
        VoiceSessionLogger::new(DebugFlag::new(true), capacity)
    }

    #[test]
    fn follows_config_debug_flag() {
        let config = Config::default();
        let logger = VoiceSessionLogger::from_config(&config);
        logger.audio("before", json!({}));
        assert!(logger.entries().is_empty());

        // Flipping the shared flag (as `--debug` does) turns the log on
        config.debug.set(true);
        logger.audio("after", json!({}));
        assert_eq!(logger.entries().len(), 1);
        assert_eq!(logger.entries()[0].event, "after");
    }

    #[test]
    fn inert_when_debug_disabled() {
        let logger = VoiceSessionLogger::new(DebugFlag::new(false), 10);
        logger.session("started", json!({}));
        logger.error("boom", json!({ "reason": "x" }));
        assert!(logger.entries().is_empty());
    }

    #[test]
    fn flag_is_read_on_every_call() {
        let flag = DebugFlag::new(false);
        let logger = VoiceSessionLogger::new(flag.clone(), 10);

        logger.audio("ignored", json!(null));
        flag.set(true);
        logger.audio("kept", json!(null));
        flag.set(false);
        logger.audio("ignored again", json!(null));

        let entries = logger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "kept");
    }

    #[test]
    fn drops_oldest_past_capacity() {
        let logger = enabled(3);
        for i in 0..5 {
            logger.message(&format!("m{i}"), json!(null));
        }

        let events: Vec<String> = logger.entries().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn entries_carry_conversation_tags() {
        let logger = enabled(10);
        logger.session("before", json!(null));
        logger.set_conversation("conv-1", AgentType::Onboarding);
        logger.tool("updateProfile", json!({ "field": "age" }));
        logger.clear_conversation();
        logger.session("after", json!(null));

        let tagged = logger.by_conversation("conv-1");
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].agent_type, Some(AgentType::Onboarding));
        assert_eq!(logger.by_category(LogCategory::Session).len(), 2);
    }

    #[test]
    fn recent_errors_returns_tail() {
        let logger = enabled(20);
        for i in 0..4 {
            logger.error(&format!("e{i}"), json!(null));
            logger.state("noise", json!(null));
        }

        let recent: Vec<String> = logger.recent_errors(2).into_iter().map(|e| e.event).collect();
        assert_eq!(recent, vec!["e2", "e3"]);
        assert_eq!(logger.recent_errors(10).len(), 4);
    }

    #[test]
    fn export_is_valid_json() {
        let logger = enabled(10);
        logger.set_conversation("conv-9", AgentType::Assistant);
        logger.context("sent", json!({ "bytes": 120 }));

        let exported = logger.export_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["conversationId"], "conv-9");
        assert_eq!(value["agentType"], "assistant");
        assert_eq!(value["entries"][0]["category"], "context");
        assert_eq!(value["entries"][0]["data"]["bytes"], 120);
    }
}
