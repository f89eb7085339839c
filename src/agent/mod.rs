//! Conversational agent channel
//!
//! The transport to the managed speech agent is external. The session
//! controller only depends on [`AgentChannel`] and consumes [`AgentEvent`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;
use crate::session::AgentType;
use crate::tools::{ToolInvocation, ToolResult};
use crate::voice::AudioChunk;

/// Who produced a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// Events delivered by the agent channel
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Transcript { speaker: Speaker, text: String },
    /// A fragment of agent speech
    Audio(AudioChunk),
    /// The agent's tool request; answer with [`AgentChannel::send_tool_result`]
    ToolCall(ToolInvocation),
    /// The agent stopped speaking because it detected the user
    Interrupted,
    Disconnected { reason: Option<String> },
}

/// A live connection to the agent
#[derive(Debug)]
pub struct AgentConnection {
    pub conversation_id: String,
    pub events: mpsc::Receiver<AgentEvent>,
}

/// Bidirectional agent transport
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Open a conversation
    async fn start(&self, agent_type: AgentType) -> Result<AgentConnection>;

    /// Send the full context block; done once per conversation
    async fn send_context(&self, context: &str) -> Result<()>;

    /// Send an incremental context notice
    async fn send_contextual_update(&self, text: &str) -> Result<()>;

    /// Answer a tool call
    async fn send_tool_result(&self, invocation_id: &str, result: &ToolResult) -> Result<()>;

    /// Close the conversation
    async fn end(&self) -> Result<()>;
}
