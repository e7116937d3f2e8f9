//! Bearer-authenticated API client with refresh-on-401.

use super::{ApiError, ApiErrorCode, HttpRequest, HttpResponse, Transport};
use crate::auth::{AuthEvent, AuthEvents, TokenRecord, TokenResponse, TokenStore};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Per-request correlation id header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";

type RefreshFuture = Shared<BoxFuture<'static, Result<String, ApiError>>>;

struct Inner {
    base_url: String,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    events: AuthEvents,
    /// In-flight refresh shared by every caller that hits a 401 meanwhile.
    pending_refresh: Mutex<Option<(u64, RefreshFuture)>>,
    refresh_seq: AtomicU64,
}

/// HTTP client for the backend API.
///
/// Cheap to clone; clones share tokens and the in-flight refresh.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenStore>,
        events: AuthEvents,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            inner: Arc::new(Inner {
                base_url,
                transport,
                tokens,
                events,
                pending_refresh: Mutex::new(None),
                refresh_seq: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    #[must_use]
    pub fn events(&self) -> &AuthEvents {
        &self.inner.events
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, ApiError> {
        let response = self.execute(Method::GET, path, None).await?;
        decode(&response)
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ApiError> {
        let response = self
            .execute(Method::POST, path, Some(to_value(body)?))
            .await?;
        decode(&response)
    }

    pub async fn put_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ApiError> {
        let response = self
            .execute(Method::PUT, path, Some(to_value(body)?))
            .await?;
        decode(&response)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::DELETE, path, None).await?;
        Ok(())
    }

    /// Exchange credentials for tokens and store them.
    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let request = HttpRequest {
            method: Method::POST,
            url: self.url(LOGIN_PATH),
            headers: base_headers()?,
            body: Some(json!({ "username": username, "password": password })),
        };
        let response = into_result(self.inner.transport.send(request).await?)?;
        let tokens: TokenResponse = decode(&response)?;

        self.inner
            .tokens
            .set_tokens(TokenRecord::from_response(tokens, None));
        self.inner.events.emit(AuthEvent::LoggedIn);
        Ok(())
    }

    /// Drop stored tokens.
    pub fn logout(&self) {
        self.inner.tokens.clear_tokens();
        self.inner.events.emit(AuthEvent::LoggedOut);
    }

    /// Refresh the access token, joining a refresh already in flight.
    ///
    /// On failure the token store is cleared and [`AuthEvent::Expired`] is
    /// emitted before the error is returned.
    pub async fn refresh_access_token(&self) -> Result<String, ApiError> {
        let (id, refresh) = {
            let mut pending = self
                .inner
                .pending_refresh
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.as_ref() {
                Some((id, refresh)) => (*id, refresh.clone()),
                None => {
                    let id = self.inner.refresh_seq.fetch_add(1, Ordering::Relaxed);
                    let refresh = refresh_tokens(
                        self.url(REFRESH_PATH),
                        Arc::clone(&self.inner.transport),
                        Arc::clone(&self.inner.tokens),
                        self.inner.events.clone(),
                    )
                    .boxed()
                    .shared();
                    *pending = Some((id, refresh.clone()));
                    (id, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut pending = self
            .inner
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().is_some_and(|(current, _)| *current == id) {
            *pending = None;
        }
        result
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{path}", self.inner.base_url)
    }

    /// Build a request with auth and correlation headers.
    ///
    /// Also returns the access token that was attached, if any.
    fn build_request(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<(HttpRequest, Option<String>), ApiError> {
        let mut headers = base_headers()?;

        let token = self.inner.tokens.access_token();
        if let Some(token) = &token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ApiError::new(
                    ApiErrorCode::InvalidRequest,
                    "Bearer token contains invalid header characters",
                )
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let request = HttpRequest {
            method: method.clone(),
            url: url.to_string(),
            headers,
            body: body.cloned(),
        };
        Ok((request, token))
    }

    /// Send once; on 401 refresh (or pick up a newer token) and retry once.
    ///
    /// An access token that expired locally is refreshed before sending.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<HttpResponse, ApiError> {
        let url = self.url(path);
        if self.inner.tokens.needs_refresh() {
            tracing::debug!(url = %url, "access token expired, refreshing before request");
            self.refresh_access_token().await?;
        }

        let (request, sent_token) = self.build_request(&method, &url, body.as_ref())?;
        tracing::debug!(
            request_id = request_id(&request),
            method = %method,
            url = %url,
            "api request"
        );

        let response = self.inner.transport.send(request).await?;
        if response.status != 401 {
            return into_result(response);
        }

        // Another caller may already have refreshed since this request left
        let current = self.inner.tokens.access_token();
        if current.is_none() || current == sent_token {
            tracing::debug!(url = %url, "401 received, refreshing access token");
            self.refresh_access_token().await?;
        }

        let (retry, _) = self.build_request(&method, &url, body.as_ref())?;
        tracing::debug!(
            request_id = request_id(&retry),
            url = %url,
            "retrying after refresh"
        );
        into_result(self.inner.transport.send(retry).await?)
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.base_url)
            .finish_non_exhaustive()
    }
}

async fn refresh_tokens(
    url: String,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    events: AuthEvents,
) -> Result<String, ApiError> {
    match request_refresh(&url, transport.as_ref(), &tokens).await {
        Ok(record) => {
            let access_token = record.access_token.clone();
            tokens.set_tokens(record);
            events.emit(AuthEvent::Refreshed);
            Ok(access_token)
        }
        Err(e) => {
            tracing::warn!("Token refresh failed: {e}");
            tokens.clear_tokens();
            events.emit(AuthEvent::Expired {
                reason: e.message.clone(),
            });
            Err(ApiError {
                code: ApiErrorCode::Unauthorized,
                message: format!("Token refresh failed: {}", e.message),
                status: e.status,
                details: e.details,
            })
        }
    }
}

async fn request_refresh(
    url: &str,
    transport: &dyn Transport,
    tokens: &TokenStore,
) -> Result<TokenRecord, ApiError> {
    let refresh_token = tokens
        .refresh_token()
        .ok_or_else(|| ApiError::unauthorized("No refresh token available"))?;

    let request = HttpRequest {
        method: Method::POST,
        url: url.to_string(),
        headers: base_headers()?,
        body: Some(json!({ "refresh_token": refresh_token })),
    };
    let response = into_result(transport.send(request).await?)?;
    let token_response: TokenResponse = decode(&response)?;

    Ok(TokenRecord::from_response(
        token_response,
        Some(&refresh_token),
    ))
}

fn base_headers() -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let request_id = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .map_err(|e| ApiError::new(ApiErrorCode::InvalidRequest, e.to_string()))?;
    headers.insert(REQUEST_ID_HEADER, request_id);
    Ok(headers)
}

fn request_id(request: &HttpRequest) -> &str {
    request
        .headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn into_result(response: HttpResponse) -> Result<HttpResponse, ApiError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ApiError::from_response(response.status, &response.body))
    }
}

fn to_value<T: Serialize + ?Sized>(body: &T) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::new(ApiErrorCode::InvalidRequest, e.to_string()))
}

fn decode<R: DeserializeOwned>(response: &HttpResponse) -> Result<R, ApiError> {
    // Treat an empty body as JSON null so `()` and `Option<_>` decode
    let body = if response.body.trim().is_empty() {
        "null"
    } else {
        response.body.as_str()
    };
    serde_json::from_str(body).map_err(|e| {
        ApiError::decode(format!("Failed to parse response: {e}"), &response.body)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fake backend: accepts exactly one bearer token at a time.
    struct FakeApi {
        valid_token: Mutex<String>,
        refresh_calls: AtomicUsize,
        refresh_delay: Duration,
        refresh_fails: bool,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl FakeApi {
        fn new(valid_token: &str) -> Self {
            Self {
                valid_token: Mutex::new(valid_token.to_string()),
                refresh_calls: AtomicUsize::new(0),
                refresh_delay: Duration::from_millis(20),
                refresh_fails: false,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing_refresh(mut self) -> Self {
            self.refresh_fails = true;
            self
        }

        fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.ends_with(suffix))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            self.seen.lock().unwrap().push(request.clone());

            if request.url.ends_with(REFRESH_PATH) {
                let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.refresh_delay).await;
                if self.refresh_fails {
                    return Ok(HttpResponse::new(
                        401,
                        r#"{"message":"refresh token revoked"}"#,
                    ));
                }
                let token = format!("token-{n}");
                *self.valid_token.lock().unwrap() = token.clone();
                return Ok(HttpResponse::new(
                    200,
                    json!({ "access_token": token, "expires_in": 3600 }).to_string(),
                ));
            }

            if request.url.ends_with(LOGIN_PATH) {
                return Ok(HttpResponse::new(
                    200,
                    json!({
                        "access_token": "login-token",
                        "refresh_token": "login-refresh",
                        "expires_in": 3600
                    })
                    .to_string(),
                ));
            }

            if request.url.ends_with("/always-401") {
                return Ok(HttpResponse::new(401, r#"{"message":"nope"}"#));
            }

            if request.url.ends_with("/offline") {
                return Err(ApiError::network("connection refused"));
            }

            let expected = format!("Bearer {}", self.valid_token.lock().unwrap());
            let auth = request
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if auth == Some(expected.as_str()) {
                Ok(HttpResponse::new(200, r#"{"ok":true}"#))
            } else {
                Ok(HttpResponse::new(401, r#"{"message":"Token expired"}"#))
            }
        }
    }

    fn client_with(api: Arc<FakeApi>, tokens: TokenRecord) -> ApiClient {
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let store = Arc::new(TokenStore::load(storage, "tokens"));
        store.set_tokens(tokens);
        ApiClient::new("https://api.example.com/", api, store, AuthEvents::new())
    }

    fn stale_tokens() -> TokenRecord {
        TokenRecord::bearer("stale")
            .with_refresh_token("refresh")
            .with_expires_at(Utc::now() + ChronoDuration::hours(1))
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_request_id() {
        let api = Arc::new(FakeApi::new("good"));
        let client = client_with(api.clone(), TokenRecord::bearer("good"));

        let body: Value = client.get_json("/issues").await.unwrap();
        assert_eq!(body["ok"], true);

        let seen = api.requests_to("/issues");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].url, "https://api.example.com/issues");
        assert_eq!(seen[0].headers.get(AUTHORIZATION).unwrap(), "Bearer good");
        let request_id = seen[0].headers.get(REQUEST_ID_HEADER).unwrap();
        assert!(uuid::Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_then_retry_once() {
        let api = Arc::new(FakeApi::new("fresh-not-yet-issued"));
        let client = client_with(api.clone(), stale_tokens());

        let body: Value = client.get_json("/users").await.unwrap();
        assert_eq!(body["ok"], true);

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        let seen = api.requests_to("/users");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");
        assert_eq!(
            client.tokens().get_tokens().unwrap().refresh_token.as_deref(),
            Some("refresh")
        );
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let api = Arc::new(FakeApi::new("not-stale"));
        let client = client_with(api.clone(), stale_tokens());

        let calls = (0..5).map(|i| {
            let client = client.clone();
            async move { client.get_json::<Value>(&format!("/issues/{i}")).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);

        let retried: Vec<_> = api
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.headers.get(AUTHORIZATION).is_some_and(|v| v == "Bearer token-1"))
            .map(|r| r.url.clone())
            .collect();
        assert_eq!(retried.len(), 5);
    }

    #[tokio::test]
    async fn test_second_401_is_surfaced() {
        let api = Arc::new(FakeApi::new("whatever"));
        let client = client_with(api.clone(), stale_tokens());

        let err = client.get_json::<Value>("/always-401").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(err.status, 401);
        assert_eq!(err.message, "nope");

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.requests_to("/always-401").len(), 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_clears_tokens_and_notifies() {
        let api = Arc::new(FakeApi::new("unreachable").failing_refresh());
        let client = client_with(api.clone(), stale_tokens());
        let mut events = client.events().subscribe();

        let err = client.get_json::<Value>("/issues").await.unwrap_err();
        assert_eq!(err.code, ApiErrorCode::Unauthorized);
        assert!(err.message.contains("refresh token revoked"));

        assert!(client.tokens().get_tokens().is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            AuthEvent::Expired { .. }
        ));
        // No retry after a failed refresh
        assert_eq!(api.requests_to("/issues").len(), 1);
    }

    #[tokio::test]
    async fn test_expired_access_token_refreshed_before_send() {
        let api = Arc::new(FakeApi::new("unknown-until-refresh"));
        let client = client_with(
            api.clone(),
            TokenRecord::bearer("old")
                .with_refresh_token("valid-refresh")
                .with_expires_at(Utc::now() - ChronoDuration::seconds(1)),
        );

        let body: Value = client.get_json("/issues").await.unwrap();
        assert_eq!(body["ok"], true);

        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        let refresh = &api.requests_to(REFRESH_PATH)[0];
        assert_eq!(refresh.body.as_ref().unwrap()["refresh_token"], "valid-refresh");

        let seen = api.requests_to("/issues");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");

        let tokens = client.tokens().get_tokens().unwrap();
        assert_eq!(tokens.access_token, "token-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("valid-refresh"));
    }

    #[tokio::test]
    async fn test_concurrent_expired_requests_share_one_refresh() {
        let api = Arc::new(FakeApi::new("unknown-until-refresh"));
        let client = client_with(
            api.clone(),
            TokenRecord::bearer("old")
                .with_refresh_token("valid-refresh")
                .with_expires_at(Utc::now() - ChronoDuration::seconds(1)),
        );

        let calls = (0..4).map(|i| {
            let client = client.clone();
            async move { client.get_json::<Value>(&format!("/issues/{i}")).await }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_expires_session() {
        let api = Arc::new(FakeApi::new("other"));
        let client = client_with(api.clone(), TokenRecord::bearer("stale"));

        let err = client.get_json::<Value>("/issues").await.unwrap_err();
        assert!(err.is_unauthorized());
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);
        assert!(!client.tokens().is_authenticated());
    }

    #[tokio::test]
    async fn test_network_error_normalized() {
        let api = Arc::new(FakeApi::new("good"));
        let client = client_with(api, TokenRecord::bearer("good"));

        let err = client.delete("/offline").await.unwrap_err();
        assert_eq!(err.code, ApiErrorCode::Network);
        assert_eq!(err.status, 0);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_body() {
        struct Garbage;

        #[async_trait]
        impl Transport for Garbage {
            async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ApiError> {
                Ok(HttpResponse::new(200, "<html>"))
            }
        }

        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tokens = Arc::new(TokenStore::load(storage, "tokens"));
        let client = ApiClient::new("http://localhost", Arc::new(Garbage), tokens, AuthEvents::new());

        let err = client.get_json::<Value>("/issues").await.unwrap_err();
        assert_eq!(err.code, ApiErrorCode::Decode);
        assert_eq!(err.details, Some(Value::String("<html>".into())));
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let api = Arc::new(FakeApi::new("login-token"));
        let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let tokens = Arc::new(TokenStore::load(storage, "tokens"));
        let client = ApiClient::new("https://api.example.com", api.clone(), tokens, AuthEvents::new());
        let mut events = client.events().subscribe();

        client.login("staff", "secret").await.unwrap();
        assert!(client.tokens().is_authenticated());
        assert_eq!(events.recv().await.unwrap(), AuthEvent::LoggedIn);

        let login = &api.requests_to(LOGIN_PATH)[0];
        assert_eq!(login.body.as_ref().unwrap()["username"], "staff");
        assert!(login.headers.get(AUTHORIZATION).is_none());

        let body: Value = client.put_json("/issues/7", &json!({"status": "resolved"})).await.unwrap();
        assert_eq!(body["ok"], true);

        client.logout();
        assert!(!client.tokens().is_authenticated());
        assert_eq!(events.recv().await.unwrap(), AuthEvent::LoggedOut);
    }
}
