//! Agent tool calls
//!
//! The agent names a tool and passes JSON parameters. [`ToolCall::parse`]
//! turns that into a closed set of cases, and [`ToolDispatcher`] runs each
//! one, always answering with a textual [`ToolResult`].

mod call;
mod dispatcher;

use serde::{Deserialize, Serialize};

pub use call::{ProfileField, ToolCall};
pub use dispatcher::{SessionControl, ToolDispatcher};

/// A named tool request from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    /// Correlates the result with the request on the agent channel
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl ToolInvocation {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, parameters: serde_json::Value) -> Self {
        let parameters = match parameters {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Outcome of a tool call, rendered as text for the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub message: String,
}

impl ToolResult {
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Success,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            ToolStatus::Success => write!(f, "{}", self.message),
            ToolStatus::Error => write!(f, "ERROR: {}", self.message),
        }
    }
}
