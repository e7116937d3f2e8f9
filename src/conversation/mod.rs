//! Locally cached chat conversations.
//!
//! Conversations are scoped to a session id and kept under two hard caps:
//! a maximum number of conversations (oldest by update time are evicted)
//! and a maximum number of messages per conversation (oldest messages are
//! dropped). Nothing here is durable beyond those caps.

mod search;
mod store;

pub use search::{SearchResult, score_match};
pub use store::{ConversationEvent, ConversationStats, ConversationStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Title given to conversations created without one.
pub const DEFAULT_TITLE: &str = "New Conversation";
/// Maximum characters of an auto-derived title.
pub const TITLE_MAX_CHARS: usize = 50;
/// Maximum characters of a summary preview.
pub const PREVIEW_MAX_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Invalid conversation data: {0}")]
    InvalidImport(String),

    #[error("Imported conversation {0} is older than every stored one and was evicted")]
    ImportEvicted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    User,
    Bot,
    System,
    Agent,
}

/// A single chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cards: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub orders: Vec<Value>,
}

impl ChatMessage {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: crate::session::generate_id("msg"),
            message_type,
            sender: None,
            content: content.into(),
            timestamp: Utc::now(),
            attachments: Vec::new(),
            cards: Vec::new(),
            products: Vec::new(),
            orders: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageType::User, content)
    }

    pub fn bot(content: impl Into<String>) -> Self {
        Self::new(MessageType::Bot, content)
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_type: Option<MessageType>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
}

impl Conversation {
    pub fn new(session_id: impl Into<String>, user_id: Option<String>, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::session::generate_id("conv"),
            session_id: session_id.into(),
            user_id,
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: ConversationMetadata::default(),
        }
    }

    /// Append a message, keeping at most `max_messages` of the newest.
    pub(crate) fn push_message(&mut self, message: ChatMessage, max_messages: usize) {
        self.metadata.last_message_type = Some(message.message_type);
        self.messages.push(message);
        self.cap_messages(max_messages);
        self.updated_at = Utc::now();

        if self.messages.len() == 2
            && self.title == DEFAULT_TITLE
            && let Some(first_user) = self
                .messages
                .iter()
                .find(|m| m.message_type == MessageType::User)
        {
            self.title = truncate_with_ellipsis(&first_user.content, TITLE_MAX_CHARS);
        }
    }

    /// Keep only the most recent `max_messages`, in order.
    pub(crate) fn cap_messages(&mut self, max_messages: usize) {
        if self.messages.len() > max_messages {
            let excess = self.messages.len() - max_messages;
            self.messages.drain(..excess);
        }
        self.metadata.message_count = self.messages.len();
    }

    fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            last_message: self
                .messages
                .last()
                .map(|m| truncate_with_ellipsis(&m.content, PREVIEW_MAX_CHARS))
                .unwrap_or_default(),
            message_count: self.metadata.message_count,
            updated_at: self.updated_at,
            tags: self.metadata.tags.clone(),
        }
    }
}

/// List view of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub last_message: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

/// Limits applied on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationLimits {
    pub max_conversations: usize,
    pub max_messages: usize,
}

impl Default for ConversationLimits {
    fn default() -> Self {
        Self {
            max_conversations: 50,
            max_messages: 1000,
        }
    }
}

/// Truncate to `max` characters, appending `...` when shortened.
pub(crate) fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_shape() {
        let msg = ChatMessage::user("Pothole on 5th").with_sender("resident");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["sender"], "resident");
        assert!(json.get("cards").is_none());

        let parsed: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_push_message_caps_history() {
        let mut conv = Conversation::new("s1", None, None);
        for i in 0..5 {
            conv.push_message(ChatMessage::user(format!("m{i}")), 3);
        }
        let contents: Vec<_> = conv.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(conv.metadata.message_count, 3);
    }

    #[test]
    fn test_auto_title_from_first_user_message() {
        let mut conv = Conversation::new("s1", None, None);
        let long = "The streetlight at Maple and 3rd has been flickering for two weeks now";
        conv.push_message(ChatMessage::user(long), 1000);
        assert_eq!(conv.title, DEFAULT_TITLE);

        conv.push_message(ChatMessage::bot("Thanks, we'll look into it."), 1000);
        assert_eq!(conv.title, truncate_with_ellipsis(long, TITLE_MAX_CHARS));
        assert!(conv.title.ends_with("..."));
        assert_eq!(conv.metadata.last_message_type, Some(MessageType::Bot));
    }

    #[test]
    fn test_explicit_title_is_kept() {
        let mut conv = Conversation::new("s1", None, Some("Sanitation".into()));
        conv.push_message(ChatMessage::user("Missed pickup"), 1000);
        conv.push_message(ChatMessage::bot("Noted"), 1000);
        assert_eq!(conv.title, "Sanitation");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("abcdef", 3), "abc...");
        // Counts characters, not bytes
        assert_eq!(truncate_with_ellipsis("ñandú", 4), "ñand...");
    }
}
