//! Tool dispatch
//!
//! Every invocation yields exactly one [`ToolResult`]. Failures inside a
//! handler become `ERROR:` results instead of propagating, since the agent
//! on the other end of the channel is the only party that can react.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio::sync::mpsc;

use super::call::{ProfileField, ToolCall};
use super::{ToolInvocation, ToolResult};
use crate::Result;
use crate::context::{ContextUpdate, serialize_cart_delta, serialize_full};
use crate::logger::VoiceSessionLogger;
use crate::store::DataStore;

/// Session actions a tool may trigger
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Tear down the conversation
    async fn end_session(&self, reason: &str) -> Result<()>;

    /// Ask the host to show a page
    fn navigate(&self, page: &str);
}

/// Runs tool calls against the data store and session
pub struct ToolDispatcher {
    user_id: String,
    store: Arc<dyn DataStore>,
    control: Arc<dyn SessionControl>,
    logger: VoiceSessionLogger,
    updates: Option<mpsc::UnboundedSender<ContextUpdate>>,
    as_of: Option<NaiveDate>,
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher")
            .field("user_id", &self.user_id)
            .field("subscribed", &self.updates.is_some())
            .finish_non_exhaustive()
    }
}

impl ToolDispatcher {
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        store: Arc<dyn DataStore>,
        control: Arc<dyn SessionControl>,
        logger: VoiceSessionLogger,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            control,
            logger,
            updates: None,
            as_of: None,
        }
    }

    /// Push refreshed context here after each mutation
    #[must_use]
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ContextUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Pin the snapshot date (defaults to today, UTC)
    #[must_use]
    pub const fn with_date(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Run one invocation to completion
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> ToolResult {
        self.logger.tool(
            "invoke",
            json!({ "id": invocation.id, "name": invocation.name, "parameters": invocation.parameters }),
        );

        let result = match ToolCall::parse(invocation) {
            Ok(call) => self.run(call).await,
            Err(e) => ToolResult::error(e.to_string()),
        };

        if result.is_success() {
            tracing::debug!(tool = %invocation.name, "tool succeeded");
        } else {
            tracing::warn!(tool = %invocation.name, result = %result, "tool failed");
        }
        self.logger.tool(
            "result",
            json!({ "id": invocation.id, "name": invocation.name, "result": result.to_string() }),
        );
        result
    }

    async fn run(&self, call: ToolCall) -> ToolResult {
        match call {
            ToolCall::UpdateProfile { field, value } => self.update_profile(&field, &value).await,
            ToolCall::CompleteConversation { reason } => {
                if let Err(e) = self.store.mark_onboarding_complete(&self.user_id).await {
                    return ToolResult::error(format!("Failed to complete conversation: {e}"));
                }
                self.end(reason.as_deref().unwrap_or("completed"), "Conversation completed").await
            }
            ToolCall::EndConversation { reason } => {
                self.end(reason.as_deref().unwrap_or("ended"), "Conversation ended").await
            }
            ToolCall::NavigateTo { page } => {
                self.control.navigate(&page);
                ToolResult::success(format!("Navigated to {page}"))
            }
            ToolCall::AddToShoppingList { items } => self.add_to_shopping_list(&items).await,
            ToolCall::Unknown { name } => {
                tracing::warn!(tool = %name, "unknown tool");
                ToolResult::error(format!("Unknown tool: {name}"))
            }
        }
    }

    async fn update_profile(&self, field: &str, value: &serde_json::Value) -> ToolResult {
        let Some(parsed) = ProfileField::parse(field) else {
            tracing::warn!(field, "unknown profile field");
            return ToolResult::error(format!("Unknown field: {field}"));
        };

        let written = if parsed.is_structured() {
            match parsed.household_update(value) {
                Ok(update) => self.store.write_household(&self.user_id, update).await,
                Err(e) => Err(e),
            }
        } else {
            match parsed.profile_update(value) {
                Ok(update) => self.store.update_profile(&self.user_id, update).await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            return ToolResult::error(format!("Failed to update {field}: {e}"));
        }

        self.refresh_full().await;
        ToolResult::success(format!("Updated {field}"))
    }

    async fn add_to_shopping_list(&self, items: &[String]) -> ToolResult {
        if items.is_empty() {
            return ToolResult::error("No items given");
        }
        match self.store.add_shopping_items(&self.user_id, items).await {
            Ok(list) => {
                self.push(ContextUpdate::Delta(serialize_cart_delta(&list)));
                ToolResult::success(format!("Added {} to the shopping list", items.join(", ")))
            }
            Err(e) => ToolResult::error(format!("Failed to add to shopping list: {e}")),
        }
    }

    async fn end(&self, reason: &str, done: &str) -> ToolResult {
        match self.control.end_session(reason).await {
            Ok(()) => ToolResult::success(done),
            Err(e) => ToolResult::error(format!("Failed to end conversation: {e}")),
        }
    }

    /// Re-read the snapshot for subscribers; failures are logged only
    async fn refresh_full(&self) {
        let Some(updates) = &self.updates else {
            return;
        };
        if updates.is_closed() {
            return;
        }

        let as_of = self.as_of.unwrap_or_else(|| Utc::now().date_naive());
        match self.store.snapshot(&self.user_id, as_of).await {
            Ok(snapshot) => self.push(ContextUpdate::Full(serialize_full(&snapshot))),
            Err(e) => {
                tracing::warn!(error = %e, "context refresh failed");
                self.logger.error("context_refresh_failed", json!({ "error": e.to_string() }));
            }
        }
    }

    fn push(&self, update: ContextUpdate) {
        if let Some(updates) = &self.updates {
            self.logger.context("update_queued", json!({ "chars": update.text().len() }));
            let _ = updates.send(update);
        }
    }
}
