//! AI chat replies for the widget.
//!
//! A [`ChatBackend`] is picked once from configuration: the live upstream
//! model when an API key is configured (falling back to canned replies if
//! it fails), otherwise the canned replies alone.

mod live;
mod mock;

pub use live::LiveBackend;
pub use mock::{MockBackend, Topic};

use crate::config::ChatConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message is required")]
    EmptyMessage,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Body of `POST /api/ai/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub context: Value,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Value::Null,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    fn validate(&self) -> Result<(), ChatError> {
        if self.message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(())
    }
}

/// Follow-up the widget can offer as a button.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl SuggestedAction {
    pub fn new(label: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            label: label.into(),
            action: action.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    #[serde(default)]
    pub suggested_actions: Vec<SuggestedAction>,
    #[serde(default)]
    pub context_updates: Value,
}

/// Produces a reply to a chat message.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reply(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;
}

/// Try `primary`; answer from [`MockBackend`] if it fails.
pub struct FallbackBackend<P> {
    primary: P,
    fallback: MockBackend,
}

impl<P: ChatBackend> FallbackBackend<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary,
            fallback: MockBackend::new(),
        }
    }
}

#[async_trait]
impl<P: ChatBackend> ChatBackend for FallbackBackend<P> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn reply(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        request.validate()?;
        match self.primary.reply(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(backend = self.primary.name(), "Chat backend failed, using canned reply: {e}");
                self.fallback.reply(request).await
            }
        }
    }
}

/// Pick the backend for `config`.
#[must_use]
pub fn backend_from_config(config: &ChatConfig) -> Arc<dyn ChatBackend> {
    match config.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(api_key) => {
            tracing::debug!(model = %config.model, "Using live chat backend");
            Arc::new(FallbackBackend::new(LiveBackend::new(
                &config.base_url,
                api_key,
                &config.model,
                &config.system_prompt,
            )))
        }
        None => {
            tracing::debug!("No chat API key configured, using canned replies");
            Arc::new(MockBackend::new())
        }
    }
}
