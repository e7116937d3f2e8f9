//! Widget session tracking.
//!
//! A session identifies one visitor's continuous period of activity. It is
//! persisted under a single storage key, touched on activity, and replaced
//! once it has been idle longer than the configured timeout.

mod heartbeat;
mod manager;

pub use heartbeat::Heartbeat;
pub use manager::{SessionManager, SessionSettings};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl SessionRecord {
    /// Fresh record with zeroed counters and default preferences.
    pub fn new(user_id: Option<String>, user_agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: generate_id("session"),
            user_id: user_id.unwrap_or_else(|| generate_id("user")),
            user_agent: user_agent.into(),
            created_at: now,
            last_active_at: now,
            is_active: true,
            metadata: SessionMetadata::default(),
        }
    }

    /// True once more than `idle_timeout` has passed since the last activity.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_active_at > idle_timeout
    }

    /// Time between creation and the last recorded activity.
    ///
    /// This is not wall-clock age: a session idle for an hour reports the
    /// same duration as when it was last touched.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.last_active_at - self.created_at
    }

    fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub conversation_count: u64,
    pub message_count: u64,
    #[serde(default)]
    pub preferences: SessionPreferences,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPreferences {
    pub language: String,
    pub theme: String,
    pub notifications: bool,
}

impl Default for SessionPreferences {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            theme: "light".to_string(),
            notifications: true,
        }
    }
}

/// Partial preferences update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesUpdate {
    pub language: Option<String>,
    pub theme: Option<String>,
    pub notifications: Option<bool>,
}

impl SessionPreferences {
    pub fn apply(&mut self, update: PreferencesUpdate) {
        if let Some(language) = update.language {
            self.language = language;
        }
        if let Some(theme) = update.theme {
            self.theme = theme;
        }
        if let Some(notifications) = update.notifications {
            self.notifications = notifications;
        }
    }
}

/// Point-in-time view of the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: String,
    pub user_id: String,
    pub duration_secs: i64,
    pub conversation_count: u64,
    pub message_count: u64,
    pub is_active: bool,
}

impl From<&SessionRecord> for SessionStats {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            duration_secs: record.duration().num_seconds(),
            conversation_count: record.metadata.conversation_count,
            message_count: record.metadata.message_count,
            is_active: record.is_active,
        }
    }
}

pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = SessionRecord::new(None, "test-agent");
        assert!(record.session_id.starts_with("session_"));
        assert!(record.user_id.starts_with("user_"));
        assert!(record.is_active);
        assert_eq!(record.metadata.conversation_count, 0);
        assert_eq!(record.metadata.preferences.language, "en");
        assert_eq!(record.created_at, record.last_active_at);
    }

    #[test]
    fn test_keeps_given_user_id() {
        let record = SessionRecord::new(Some("user_42".into()), "agent");
        assert_eq!(record.user_id, "user_42");
    }

    #[test]
    fn test_idle_expiry_boundary() {
        let mut record = SessionRecord::new(None, "agent");
        let now = Utc::now();
        record.last_active_at = now - Duration::hours(24);
        assert!(!record.is_idle_expired(Duration::hours(24), now));

        record.last_active_at = now - Duration::hours(24) - Duration::seconds(1);
        assert!(record.is_idle_expired(Duration::hours(24), now));
    }

    #[test]
    fn test_duration_uses_last_activity() {
        let mut record = SessionRecord::new(None, "agent");
        record.created_at = Utc::now() - Duration::hours(3);
        record.last_active_at = record.created_at + Duration::minutes(10);
        assert_eq!(record.duration(), Duration::minutes(10));
    }

    #[test]
    fn test_preferences_partial_update() {
        let mut prefs = SessionPreferences::default();
        prefs.apply(PreferencesUpdate {
            theme: Some("dark".into()),
            ..Default::default()
        });
        assert_eq!(prefs.theme, "dark");
        assert_eq!(prefs.language, "en");
        assert!(prefs.notifications);
    }

    #[test]
    fn test_record_json_shape() {
        let record = SessionRecord::new(None, "agent");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("lastActiveAt").is_some());
        assert_eq!(json["metadata"]["conversationCount"], 0);
    }
}
