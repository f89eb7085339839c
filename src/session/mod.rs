//! Conversation sessions
//!
//! [`SessionController`] owns one conversation from wake word to teardown.
//! Outside code talks to it through a [`SessionHandle`] and observes it
//! through [`SessionEvent`]s.

mod controller;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

pub use controller::{SessionComponents, SessionController};

use crate::agent::Speaker;
use crate::context::{ContextUpdate, InventoryChange, serialize_inventory_delta};
use crate::tools::SessionControl;
use crate::voice::ActivationEvent;
use crate::{Error, Result};

/// Which agent persona a conversation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Onboarding,
    Assistant,
}

impl AgentType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Onboarding => "onboarding",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    ListeningForWakeWord,
    Active,
    AgentSpeaking,
    UserSpeaking,
    Ended,
}

impl SessionState {
    /// A conversation is open with the agent
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::AgentSpeaking | Self::UserSpeaking)
    }
}

/// The open conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub conversation_id: String,
    pub agent_type: AgentType,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}

/// What the controller reports to the host application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Activated(ActivationEvent),
    Transcript { speaker: Speaker, text: String },
    /// Microphone level while the user has the floor
    Level(u8),
    /// User finished speaking
    Silence,
    /// User interrupted the agent
    BargeIn,
    Navigate(String),
    Error(String),
    Ended { reason: String },
}

#[derive(Debug)]
pub(crate) enum Command {
    Activate,
    End { reason: String },
    Navigate(String),
}

/// Cloneable handle onto a running controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    context: mpsc::UnboundedSender<ContextUpdate>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Start a conversation without waiting for the wake word
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the controller has stopped
    pub fn activate(&self) -> Result<()> {
        self.send(Command::Activate)
    }

    /// End the conversation and stop every capture
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the controller has stopped
    pub fn end(&self, reason: &str) -> Result<()> {
        self.send(Command::End {
            reason: reason.to_string(),
        })
    }

    /// Forward a context update to the agent if a conversation is live
    pub fn push_context(&self, update: ContextUpdate) {
        let _ = self.context.send(update);
    }

    /// Report a data store inventory change
    pub fn inventory_changed(&self, change: &InventoryChange) {
        self.push_context(ContextUpdate::Delta(serialize_inventory_delta(change)));
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Channel("session controller has stopped".to_string()))
    }
}

#[async_trait]
impl SessionControl for SessionHandle {
    async fn end_session(&self, reason: &str) -> Result<()> {
        self.end(reason)
    }

    fn navigate(&self, page: &str) {
        let _ = self.send(Command::Navigate(page.to_string()));
    }
}
