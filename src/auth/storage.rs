//! Bearer token storage.

use crate::storage::{KeyValueStore, read_json};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    /// Access token for API calls.
    pub access_token: String,
    /// Refresh token for getting new access tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Absolute expiry of the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenRecord {
    /// Non-expiring bearer token.
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            token_type: default_token_type(),
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Build a record from a token endpoint response.
    ///
    /// A response without a new refresh token keeps `previous_refresh`.
    #[must_use]
    pub fn from_response(response: TokenResponse, previous_refresh: Option<&str>) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + Duration::seconds(secs));

        Self {
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
            token_type: response.token_type.unwrap_or_else(default_token_type),
        }
    }

    /// Check if the access token is expired.
    ///
    /// Records without an expiry never expire.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Forget the access token, keeping the refresh token for a later refresh.
    fn drop_access_token(&mut self) {
        self.access_token.clear();
        self.expires_at = None;
    }
}

/// Token payload returned by the login and refresh endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds.
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<u64>,
    #[serde(default, alias = "tokenType")]
    pub token_type: Option<String>,
}

/// Holds the current token record and mirrors it to storage.
///
/// Storage failures are logged and never surface to callers; the store
/// keeps working from memory.
pub struct TokenStore {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    record: RwLock<Option<TokenRecord>>,
}

impl TokenStore {
    /// Load the persisted record under `key`.
    ///
    /// An expired record is discarded, unless it holds a refresh token: then
    /// only the access token is dropped.
    pub fn load(storage: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();

        let record = match read_json::<TokenRecord>(storage.as_ref(), &key) {
            Ok(Some(record)) if record.is_expired() => {
                tracing::debug!("Persisted access token expired");
                let mut record = Some(record);
                expire(&mut record, storage.as_ref(), &key);
                record
            }
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to load tokens: {e}");
                None
            }
        };

        Self {
            storage,
            key,
            record: RwLock::new(record),
        }
    }

    /// Replace the current record and persist it.
    pub fn set_tokens(&self, record: TokenRecord) {
        let mut current = self.record.write().unwrap_or_else(PoisonError::into_inner);
        persist(self.storage.as_ref(), &self.key, &record);
        *current = Some(record);
    }

    /// The record as held in memory, without an expiry check.
    #[must_use]
    pub fn get_tokens(&self) -> Option<TokenRecord> {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the current record, in memory and in storage.
    pub fn clear_tokens(&self) {
        let mut current = self.record.write().unwrap_or_else(PoisonError::into_inner);
        *current = None;
        if let Err(e) = self.storage.remove(&self.key) {
            tracing::warn!("Failed to remove persisted tokens: {e}");
        }
    }

    /// True if an unexpired access token is held.
    ///
    /// An expired record is cleared as a side effect; a held refresh token
    /// survives it.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// The access token if present and unexpired.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        {
            let record = self.record.read().unwrap_or_else(PoisonError::into_inner);
            match record.as_ref() {
                Some(r) if r.access_token.is_empty() => return None,
                Some(r) if !r.is_expired() => return Some(r.access_token.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Check again under the write lock: a refresh may have landed since
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = record.as_ref()
            && !r.is_expired()
        {
            return Some(r.access_token.clone()).filter(|token| !token.is_empty());
        }

        tracing::debug!("Access token expired");
        expire(&mut record, self.storage.as_ref(), &self.key);
        None
    }

    /// True if the access token is gone but a refresh token can replace it.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.access_token().is_none() && self.refresh_token().is_some()
    }

    /// The refresh token, regardless of access token expiry.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|r| r.refresh_token.clone())
    }
}

/// Apply lazy expiry to `record` and mirror the result to storage.
fn expire(record: &mut Option<TokenRecord>, storage: &dyn KeyValueStore, key: &str) {
    match record {
        Some(r) if r.refresh_token.is_some() => {
            r.drop_access_token();
            persist(storage, key, r);
        }
        _ => {
            *record = None;
            if let Err(e) = storage.remove(key) {
                tracing::warn!("Failed to remove expired tokens: {e}");
            }
        }
    }
}

fn persist(storage: &dyn KeyValueStore, key: &str, record: &TokenRecord) {
    match serde_json::to_string(record) {
        Ok(raw) => {
            if let Err(e) = storage.set(key, &raw) {
                tracing::warn!("Failed to persist tokens: {e}");
            }
        }
        Err(e) => tracing::warn!("Failed to serialize tokens: {e}"),
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("key", &self.key)
            .field("authenticated", &self.get_tokens().is_some())
            .finish_non_exhaustive()
    }
}
