use crate::conversation::ConversationLimits;
use crate::session::SessionSettings;
use crate::storage::{DEFAULT_PREFIX, StorageKeys};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override for [`Config::api_base_url`].
pub const API_URL_ENV: &str = "CHATWIDGET_API_URL";
/// Environment variables checked for the chat API key, in order.
pub const CHAT_API_KEY_ENVS: &[&str] = &["CHATWIDGET_CHAT_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Issue-tracking API the authenticated client talks to.
    pub api_base_url: String,
    pub data_dir: PathBuf,
    /// Prefix for every storage key.
    pub storage_prefix: String,

    /// Sessions idle longer than this are replaced. Default: 86400 (24 hours).
    pub session_idle_timeout_secs: u64,
    /// Session heartbeat period. Default: 30.
    pub heartbeat_interval_secs: u64,

    pub max_conversations: usize,
    pub max_messages_per_conversation: usize,

    /// Listen address for `serve`.
    pub server_addr: String,

    pub chat: ChatConfig,
}

/// Upstream LLM used by the chat endpoint. Without an API key the
/// built-in canned replies are used.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
}

impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful assistant for a city's civic issue tracker. \
                Help residents and staff report, find and follow up on issues such as \
                potholes, broken streetlights, sanitation and graffiti. Be brief."
                .to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("chatwidget"))
            .unwrap_or_else(|| PathBuf::from(".chatwidget"));

        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            data_dir,
            storage_prefix: DEFAULT_PREFIX.to_string(),
            session_idle_timeout_secs: 24 * 60 * 60,
            heartbeat_interval_secs: 30,
            max_conversations: 50,
            max_messages_per_conversation: 1000,
            server_addr: "127.0.0.1:3001".to_string(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("chatwidget").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".chatwidget/config.toml"))
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from(&Self::default_path())?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if self.chat.api_key.is_none() {
            self.chat.api_key = CHAT_API_KEY_ENVS
                .iter()
                .find_map(|name| lookup(name).filter(|v| !v.is_empty()));
        }
    }

    /// Path of the long-lived storage file.
    #[must_use]
    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("storage.json")
    }

    #[must_use]
    pub fn storage_keys(&self) -> StorageKeys {
        StorageKeys::with_prefix(&self.storage_prefix)
    }

    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: chrono::Duration::seconds(
                i64::try_from(self.session_idle_timeout_secs)
                    .unwrap_or(i64::MAX)
                    .min(i64::MAX / 1000),
            ),
            heartbeat_interval: std::time::Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            ..SessionSettings::default()
        }
    }

    #[must_use]
    pub fn conversation_limits(&self) -> ConversationLimits {
        ConversationLimits {
            max_conversations: self.max_conversations.max(1),
            max_messages: self.max_messages_per_conversation.max(1),
        }
    }
}
