//! Authenticated HTTP access to the backend API.
//!
//! [`ApiClient`] attaches bearer tokens, refreshes them on 401 and
//! normalizes every failure into [`ApiError`]. The wire is abstracted
//! behind [`Transport`] so the retry logic can run against a fake.

mod client;
mod error;
mod transport;

pub use client::{ApiClient, REQUEST_ID_HEADER};
pub use error::{ApiError, ApiErrorCode};
pub use transport::ReqwestTransport;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde_json::Value;

/// A fully built outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// A response as seen by the client. Bodies are read eagerly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests over the wire.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}
