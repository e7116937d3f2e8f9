//! Key-value persistence scopes.
//!
//! Mirrors the two browser storage areas the widget writes to: a
//! page-lifetime scope ([`MemoryStore`]) and a long-lived scope
//! ([`FileStore`]). Both speak plain strings; typed access goes through
//! [`read_json`] and [`write_json`].

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Quota exceeded writing {key} (limit {limit} bytes)")]
    QuotaExceeded { key: String, limit: usize },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// String key-value storage with browser `Storage` semantics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// Read and deserialize a JSON value stored under `key`.
pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// The two storage areas available to the widget.
#[derive(Clone)]
pub struct StorageScopes {
    /// Cleared when the hosting page goes away.
    pub page: Arc<dyn KeyValueStore>,
    /// Survives reloads.
    pub persistent: Arc<dyn KeyValueStore>,
}

impl StorageScopes {
    pub fn new(page: Arc<dyn KeyValueStore>, persistent: Arc<dyn KeyValueStore>) -> Self {
        Self { page, persistent }
    }

    /// Both scopes in memory. Used by tests and ephemeral embeddings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            page: Arc::new(MemoryStore::new()),
            persistent: Arc::new(MemoryStore::new()),
        }
    }
}

impl std::fmt::Debug for StorageScopes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageScopes").finish_non_exhaustive()
    }
}

/// Literal storage key names, derived from a shared prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub tokens: String,
    pub session: String,
    pub conversations: String,
    pub current_conversations: String,
}

impl StorageKeys {
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            tokens: format!("{prefix}_tokens"),
            session: format!("{prefix}_session"),
            conversations: format!("{prefix}_conversations"),
            current_conversations: format!("{prefix}_current_conversations"),
        }
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "ashi_widget";
