//! Kaeva Voice - hands-free conversational voice engine
//!
//! This library provides the core of a turn-taking voice agent:
//! - Wake word detection over a continuous speech-recognition stream
//! - Voice activity and barge-in monitoring on the microphone
//! - Agent audio decoding and interruptible playback
//! - Tool dispatch and context serialization for the agent
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Host application                       │
//! │     SessionHandle  │  SessionEvent  │  DataStore     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Session controller                     │
//! │  Wake Word  │  VAD  │  Barge-in  │  Player  │ Tools │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │            Agent channel (external)                  │
//! │   Transcripts  │  Audio  │  Tool calls  │  Context   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logger;
pub mod session;
pub mod store;
pub mod tools;
pub mod voice;

pub use agent::{AgentChannel, AgentConnection, AgentEvent, Speaker};
pub use config::Config;
pub use context::{ContextSnapshot, ContextUpdate, serialize_full};
pub use db::{DbConn, DbPool, SqliteStore};
pub use error::{Error, Result};
pub use logger::{DebugFlag, LogCategory, LogEntry, VoiceSessionLogger};
pub use session::{
    AgentType, ConversationSession, SessionComponents, SessionController, SessionEvent,
    SessionHandle, SessionState,
};
pub use store::{DataStore, HouseholdUpdate, ProfileUpdate};
pub use tools::{ToolCall, ToolDispatcher, ToolInvocation, ToolResult};
