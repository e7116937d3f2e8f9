//! Application wiring for the chat widget.
//!
//! Every component is constructed once here and handed out by reference;
//! nothing is held in module-level state.

use crate::auth::{AuthEvents, TokenStore};
use crate::chat::{ChatBackend, ChatError, ChatRequest, ChatResponse, backend_from_config};
use crate::config::Config;
use crate::conversation::{
    ChatMessage, Conversation, ConversationStore, ConversationSummary, SearchResult,
};
use crate::error::Result;
use crate::http::{ApiClient, ReqwestTransport};
use crate::session::{Heartbeat, SessionManager};
use crate::storage::{FileStore, MemoryStore, StorageKeys, StorageScopes};
use serde_json::json;
use std::sync::Arc;

/// One user message and the reply stored after it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub conversation: Conversation,
    pub reply: ChatResponse,
}

pub struct ChatWidget {
    api: ApiClient,
    session: Arc<SessionManager>,
    conversations: Arc<ConversationStore>,
    backend: Arc<dyn ChatBackend>,
}

impl ChatWidget {
    pub fn new(
        api: ApiClient,
        session: Arc<SessionManager>,
        conversations: Arc<ConversationStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            api,
            session,
            conversations,
            backend,
        }
    }

    /// Build every component from `config`, persisting to `config.storage_path()`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let persistent = Arc::new(FileStore::open(config.storage_path())?);
        let scopes = StorageScopes::new(Arc::new(MemoryStore::new()), persistent);
        Ok(Self::with_storage(config, scopes, &config.storage_keys()))
    }

    /// Build every component over caller-supplied storage.
    pub fn with_storage(config: &Config, scopes: StorageScopes, keys: &StorageKeys) -> Self {
        let tokens = Arc::new(TokenStore::load(
            Arc::clone(&scopes.persistent),
            keys.tokens.clone(),
        ));
        let api = ApiClient::new(
            &config.api_base_url,
            Arc::new(ReqwestTransport::new()),
            tokens,
            AuthEvents::new(),
        );
        let session = Arc::new(SessionManager::load(
            Arc::clone(&scopes.persistent),
            keys.session.clone(),
            config.session_settings(),
        ));
        let conversations = Arc::new(ConversationStore::load(
            scopes,
            keys,
            config.conversation_limits(),
        ));

        Self::new(api, session, conversations, backend_from_config(&config.chat))
    }

    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    #[must_use]
    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Keep the current session alive while the widget is open.
    #[must_use]
    pub fn start_heartbeat(&self) -> Heartbeat {
        self.session.start_heartbeat()
    }

    /// Open a conversation in the current session.
    pub fn start_conversation(&self, title: Option<&str>) -> Conversation {
        let session = self.session.ensure_session();
        let conversation =
            self.conversations
                .create_conversation(&session.session_id, Some(&session.user_id), title);
        self.session.increment_conversation_count();
        conversation
    }

    /// Store `text` as a user message, ask the backend, and store its reply.
    ///
    /// Without a `conversation_id` a new conversation is started.
    pub async fn send_message(&self, conversation_id: Option<&str>, text: &str) -> Result<Exchange> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }

        let conversation_id = match conversation_id {
            Some(id) => id.to_string(),
            None => self.start_conversation(None).id,
        };

        let conversation = self
            .conversations
            .add_message(&conversation_id, ChatMessage::user(text))?;
        self.session.increment_message_count();

        let request = ChatRequest::new(text).with_context(json!({
            "session_id": conversation.session_id,
            "conversation_id": conversation.id,
            "message_count": conversation.messages.len(),
        }));
        let reply = self.backend.reply(&request).await?;

        let conversation = self.conversations.add_message(
            &conversation_id,
            ChatMessage::bot(reply.response.clone()).with_sender(self.backend.name()),
        )?;
        self.session.increment_message_count();

        Ok(Exchange {
            conversation,
            reply,
        })
    }

    /// Summaries of the current session's conversations, newest first.
    #[must_use]
    pub fn history(&self) -> Vec<ConversationSummary> {
        match self.session.session_id() {
            Some(id) => self.conversations.get_conversation_summaries(Some(&id)),
            None => Vec::new(),
        }
    }

    /// Search the current session's messages.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        match self.session.session_id() {
            Some(id) => self.conversations.search_messages(query, Some(&id)),
            None => Vec::new(),
        }
    }

    /// Drop the current session and its conversations.
    pub fn end_session(&self) -> usize {
        let removed = self
            .session
            .session_id()
            .map_or(0, |id| self.conversations.clear_session(&id));
        self.session.clear_session();
        removed
    }
}

impl std::fmt::Debug for ChatWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatWidget")
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}
