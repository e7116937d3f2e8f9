//! Session lifecycle and persistence.

use super::{Heartbeat, PreferencesUpdate, SessionMetadata, SessionRecord, SessionStats};
use crate::storage::{KeyValueStore, read_json, write_json};
use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default idle timeout: 24 hours.
pub const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 24 * 60 * 60;
/// Default heartbeat period: 30 seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Sessions idle for longer than this are discarded on load.
    pub idle_timeout: Duration,
    /// Period of the activity heartbeat.
    pub heartbeat_interval: std::time::Duration,
    /// Recorded on new sessions.
    pub user_agent: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::seconds(DEFAULT_IDLE_TIMEOUT_SECS),
            heartbeat_interval: std::time::Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            user_agent: concat!("chatwidget/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Owns the current [`SessionRecord`] and writes every change through.
///
/// Writes are not batched. Another process writing the same key wins on
/// its next write; there is no merge.
pub struct SessionManager {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    settings: SessionSettings,
    current: Mutex<Option<SessionRecord>>,
}

impl SessionManager {
    /// Load the persisted session, or start a new one if none is usable.
    pub fn load(
        storage: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        settings: SessionSettings,
    ) -> Self {
        let key = key.into();
        let stored = match read_json::<SessionRecord>(storage.as_ref(), &key) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!("Failed to load session: {e}");
                None
            }
        };

        let manager = Self {
            storage,
            key,
            settings,
            current: Mutex::new(None),
        };

        match stored {
            Some(record) if !record.is_idle_expired(manager.settings.idle_timeout, Utc::now()) => {
                tracing::debug!(session_id = %record.session_id, "Resuming session");
                manager.replace(|current| {
                    let mut record = record;
                    record.is_active = true;
                    record.touch();
                    *current = Some(record);
                });
            }
            Some(record) => {
                tracing::debug!(session_id = %record.session_id, "Session idle expired");
                manager.create_new_session(None);
            }
            None => {
                manager.create_new_session(None);
            }
        }

        manager
    }

    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Start a fresh session, replacing any current one.
    pub fn create_new_session(&self, user_id: Option<String>) -> SessionRecord {
        let record = SessionRecord::new(user_id, self.settings.user_agent.clone());
        tracing::debug!(session_id = %record.session_id, "Created session");
        self.replace(|current| *current = Some(record.clone()));
        record
    }

    /// The current session, if one is held.
    #[must_use]
    pub fn current(&self) -> Option<SessionRecord> {
        self.lock().clone()
    }

    /// The current session, creating one if it was cleared.
    pub fn ensure_session(&self) -> SessionRecord {
        match self.current() {
            Some(record) => record,
            None => self.create_new_session(None),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock().as_ref().map(|s| s.session_id.clone())
    }

    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.lock().as_ref().map(|s| s.user_id.clone())
    }

    /// Record activity now.
    pub fn update_activity(&self) {
        self.modify(SessionRecord::touch);
    }

    /// Apply `f` to the session metadata and persist.
    pub fn update_metadata(&self, f: impl FnOnce(&mut SessionMetadata)) {
        self.modify(|record| {
            f(&mut record.metadata);
            record.touch();
        });
    }

    pub fn increment_conversation_count(&self) {
        self.update_metadata(|m| m.conversation_count += 1);
    }

    pub fn increment_message_count(&self) {
        self.update_metadata(|m| m.message_count += 1);
    }

    /// Add a tag unless already present.
    pub fn add_tag(&self, tag: &str) {
        self.update_metadata(|m| {
            if !m.tags.iter().any(|t| t == tag) {
                m.tags.push(tag.to_string());
            }
        });
    }

    pub fn remove_tag(&self, tag: &str) {
        self.update_metadata(|m| m.tags.retain(|t| t != tag));
    }

    pub fn update_preferences(&self, update: PreferencesUpdate) {
        self.update_metadata(|m| m.preferences.apply(update));
    }

    /// Hosting page became visible or hidden. Both count as activity.
    pub fn set_visibility(&self, visible: bool) {
        self.modify(|record| {
            record.is_active = visible;
            record.touch();
        });
    }

    /// Hosting page is going away. The record is kept.
    pub fn deactivate(&self) {
        self.modify(|record| record.is_active = false);
    }

    /// Forget the session in memory and in storage.
    pub fn clear_session(&self) {
        *self.lock() = None;
        if let Err(e) = self.storage.remove(&self.key) {
            tracing::warn!("Failed to remove session: {e}");
        }
    }

    /// True if the held session has been idle past the timeout.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|s| s.is_idle_expired(self.settings.idle_timeout, Utc::now()))
    }

    /// See [`SessionRecord::duration`].
    #[must_use]
    pub fn session_duration(&self) -> Option<Duration> {
        self.lock().as_ref().map(SessionRecord::duration)
    }

    #[must_use]
    pub fn stats(&self) -> Option<SessionStats> {
        self.lock().as_ref().map(SessionStats::from)
    }

    /// Touch the session every `heartbeat_interval` until the returned
    /// handle is stopped or dropped.
    pub fn start_heartbeat(self: &Arc<Self>) -> Heartbeat {
        Heartbeat::start(Arc::clone(self), self.settings.heartbeat_interval)
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionRecord>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the held session (if any) and persist it.
    fn modify(&self, f: impl FnOnce(&mut SessionRecord)) {
        self.replace(|current| {
            if let Some(record) = current.as_mut() {
                f(record);
            }
        });
    }

    fn replace(&self, f: impl FnOnce(&mut Option<SessionRecord>)) {
        let mut current = self.lock();
        f(&mut current);
        if let Some(record) = current.as_ref()
            && let Err(e) = write_json(self.storage.as_ref(), &self.key, record)
        {
            // Session stays usable in memory for this process
            tracing::warn!("Failed to persist session: {e}");
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("key", &self.key)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}
