//! Conversation index persistence.

use super::search::{self, Query};
use super::{
    ChatMessage, Conversation, ConversationError, ConversationLimits, ConversationSummary,
};
use crate::storage::{KeyValueStore, StorageKeys, StorageScopes, read_json, write_json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Change notifications, so other handles can pick up writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    Created { id: String },
    MessageAdded { conversation_id: String, message_id: String },
    Updated { id: String },
    Imported { id: String },
    Deleted { id: String },
    Evicted { ids: Vec<String> },
    SessionCleared { session_id: String, removed: usize },
}

/// Aggregate figures across all stored conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub oldest_update: Option<DateTime<Utc>>,
    pub newest_update: Option<DateTime<Utc>>,
}

/// All conversations, held in memory and written through to storage.
///
/// Each mutation rewrites the whole index into both storage scopes. Reads
/// at load time prefer the page scope when it holds anything.
pub struct ConversationStore {
    scopes: StorageScopes,
    page_key: String,
    persistent_key: String,
    limits: ConversationLimits,
    conversations: Mutex<HashMap<String, Conversation>>,
    events: broadcast::Sender<ConversationEvent>,
}

impl ConversationStore {
    pub fn load(scopes: StorageScopes, keys: &StorageKeys, limits: ConversationLimits) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            scopes,
            page_key: keys.current_conversations.clone(),
            persistent_key: keys.conversations.clone(),
            limits,
            conversations: Mutex::new(HashMap::new()),
            events,
        };
        store.reload();
        store
    }

    #[must_use]
    pub fn limits(&self) -> ConversationLimits {
        self.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Replace the in-memory index with what storage holds.
    pub fn reload(&self) {
        let loaded = self.read_index();
        tracing::debug!(count = loaded.len(), "Loaded conversations");
        *self.lock() = loaded.into_iter().map(|c| (c.id.clone(), c)).collect();
    }

    pub fn create_conversation(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        title: Option<&str>,
    ) -> Conversation {
        let conversation = Conversation::new(
            session_id,
            user_id.map(str::to_string),
            title.map(str::to_string),
        );
        let id = conversation.id.clone();

        {
            let mut conversations = self.lock();
            conversations.insert(id.clone(), conversation.clone());
            self.persist(&mut conversations);
        }

        self.emit(ConversationEvent::Created { id });
        conversation
    }

    #[must_use]
    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.lock().get(id).cloned()
    }

    /// Append a message and return the updated conversation.
    pub fn add_message(
        &self,
        conversation_id: &str,
        message: ChatMessage,
    ) -> Result<Conversation, ConversationError> {
        let message_id = message.id.clone();
        let updated = {
            let mut conversations = self.lock();
            let conversation = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))?;
            conversation.push_message(message, self.limits.max_messages);
            let updated = conversation.clone();
            self.persist(&mut conversations);
            updated
        };

        self.emit(ConversationEvent::MessageAdded {
            conversation_id: conversation_id.to_string(),
            message_id,
        });
        Ok(updated)
    }

    /// Conversations of `session_id`, most recently updated first.
    #[must_use]
    pub fn get_conversations_by_session(&self, session_id: &str) -> Vec<Conversation> {
        let mut matching: Vec<Conversation> = self
            .lock()
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        sort_by_recency(&mut matching);
        matching
    }

    /// Summaries, optionally restricted to one session, most recent first.
    #[must_use]
    pub fn get_conversation_summaries(&self, session_id: Option<&str>) -> Vec<ConversationSummary> {
        let conversations = self.lock();
        let mut matching: Vec<&Conversation> = conversations
            .values()
            .filter(|c| session_id.is_none_or(|s| c.session_id == s))
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        matching.into_iter().map(Conversation::summary).collect()
    }

    /// Ranked case-insensitive search over stored messages.
    #[must_use]
    pub fn search_messages(&self, query: &str, session_id: Option<&str>) -> Vec<search::SearchResult> {
        let Some(query) = Query::new(query) else {
            return Vec::new();
        };
        let conversations = self.lock();
        search::search(
            conversations
                .values()
                .filter(|c| session_id.is_none_or(|s| c.session_id == s)),
            &query,
        )
    }

    /// Serialize one conversation for transport.
    pub fn export_conversation(&self, id: &str) -> Result<String, ConversationError> {
        let conversation = self
            .get_conversation(id)
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(&conversation)?)
    }

    /// Accept a conversation produced by [`Self::export_conversation`].
    ///
    /// Requires string `id` and `sessionId` and an array `messages`. An
    /// existing conversation with the same id is replaced. Messages past the
    /// cap are dropped oldest first. A full store rejects an import that the
    /// conversation cap would evict straight away.
    pub fn import_conversation(&self, data: &str) -> Result<Conversation, ConversationError> {
        let mut conversation = match parse_import(data) {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::warn!("Rejected conversation import: {e}");
                return Err(e);
            }
        };
        conversation.cap_messages(self.limits.max_messages);
        let id = conversation.id.clone();

        {
            let mut conversations = self.lock();
            conversations.insert(id.clone(), conversation.clone());
            self.persist(&mut conversations);
            if !conversations.contains_key(&id) {
                tracing::warn!(id = %id, "Imported conversation evicted by conversation cap");
                return Err(ConversationError::ImportEvicted(id));
            }
        }

        self.emit(ConversationEvent::Imported { id });
        Ok(conversation)
    }

    /// Returns true if the conversation existed.
    pub fn delete_conversation(&self, id: &str) -> bool {
        let removed = {
            let mut conversations = self.lock();
            let removed = conversations.remove(id).is_some();
            if removed {
                self.persist(&mut conversations);
            }
            removed
        };

        if removed {
            self.emit(ConversationEvent::Deleted { id: id.to_string() });
        }
        removed
    }

    /// Delete every conversation of `session_id`. Returns how many went.
    pub fn clear_session(&self, session_id: &str) -> usize {
        let removed = {
            let mut conversations = self.lock();
            let before = conversations.len();
            conversations.retain(|_, c| c.session_id != session_id);
            let removed = before - conversations.len();
            self.persist(&mut conversations);
            removed
        };

        self.emit(ConversationEvent::SessionCleared {
            session_id: session_id.to_string(),
            removed,
        });
        removed
    }

    pub fn add_tag(&self, conversation_id: &str, tag: &str) -> Result<(), ConversationError> {
        self.update(conversation_id, |c| {
            if !c.metadata.tags.iter().any(|t| t == tag) {
                c.metadata.tags.push(tag.to_string());
            }
        })
    }

    pub fn remove_tag(&self, conversation_id: &str, tag: &str) -> Result<(), ConversationError> {
        self.update(conversation_id, |c| c.metadata.tags.retain(|t| t != tag))
    }

    pub fn rename(&self, conversation_id: &str, title: &str) -> Result<(), ConversationError> {
        self.update(conversation_id, |c| c.title = title.to_string())
    }

    #[must_use]
    pub fn stats(&self) -> ConversationStats {
        let conversations = self.lock();
        ConversationStats {
            total_conversations: conversations.len(),
            total_messages: conversations.values().map(|c| c.messages.len()).sum(),
            oldest_update: conversations.values().map(|c| c.updated_at).min(),
            newest_update: conversations.values().map(|c| c.updated_at).max(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn update(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut Conversation),
    ) -> Result<(), ConversationError> {
        {
            let mut conversations = self.lock();
            let conversation = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| ConversationError::NotFound(conversation_id.to_string()))?;
            f(conversation);
            self.persist(&mut conversations);
        }

        self.emit(ConversationEvent::Updated {
            id: conversation_id.to_string(),
        });
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }

    fn read_index(&self) -> Vec<Conversation> {
        let page = read_scope(self.scopes.page.as_ref(), &self.page_key);
        if !page.is_empty() {
            return page;
        }
        read_scope(self.scopes.persistent.as_ref(), &self.persistent_key)
    }

    /// Enforce the conversation cap, then write the index to both scopes.
    fn persist(&self, conversations: &mut HashMap<String, Conversation>) {
        if conversations.len() > self.limits.max_conversations {
            let mut all: Vec<Conversation> = conversations.drain().map(|(_, c)| c).collect();
            sort_by_recency(&mut all);
            let evicted: Vec<String> = all
                .drain(self.limits.max_conversations..)
                .map(|c| c.id)
                .collect();
            tracing::debug!(count = evicted.len(), "Evicting oldest conversations");
            conversations.extend(all.into_iter().map(|c| (c.id.clone(), c)));
            self.emit(ConversationEvent::Evicted { ids: evicted });
        }

        let mut index: Vec<&Conversation> = conversations.values().collect();
        index.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        for (scope, key) in [
            (self.scopes.page.as_ref(), &self.page_key),
            (self.scopes.persistent.as_ref(), &self.persistent_key),
        ] {
            if let Err(e) = write_json(scope, key, &index) {
                tracing::warn!(key = %key, "Failed to persist conversations: {e}");
            }
        }
    }
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("limits", &self.limits)
            .field("conversations", &self.len())
            .finish_non_exhaustive()
    }
}

fn read_scope(scope: &dyn KeyValueStore, key: &str) -> Vec<Conversation> {
    match read_json::<Vec<Conversation>>(scope, key) {
        Ok(index) => index.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(key = %key, "Failed to load conversations: {e}");
            Vec::new()
        }
    }
}

fn sort_by_recency(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

fn parse_import(data: &str) -> Result<Conversation, ConversationError> {
    let value: Value = serde_json::from_str(data)?;

    for field in ["id", "sessionId"] {
        if !value.get(field).is_some_and(Value::is_string) {
            return Err(ConversationError::InvalidImport(format!(
                "missing string field `{field}`"
            )));
        }
    }
    if !value.get("messages").is_some_and(Value::is_array) {
        return Err(ConversationError::InvalidImport(
            "`messages` must be an array".into(),
        ));
    }

    Ok(serde_json::from_value(value)?)
}
