//! HTTP endpoint for widget chat replies.
//!
//! Serves `POST /api/ai/chat` on a `tiny_http` listener. Requests are read on
//! a blocking thread and answered by driving the async [`ChatBackend`] on the
//! caller's tokio runtime.

use crate::chat::{ChatBackend, ChatError, ChatRequest};
use serde_json::{Value, json};
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server};

pub const CHAT_PATH: &str = "/api/ai/chat";

/// Request bodies larger than this get a 413.
const MAX_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Status and optional JSON body for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Option<Value>,
}

impl Reply {
    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self::json(status, json!({ "error": message.into() }))
    }

    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }
}

/// Route one request to a reply.
pub async fn route(backend: &dyn ChatBackend, method: &Method, url: &str, body: &str) -> Reply {
    let path = url.split('?').next().unwrap_or(url);
    if path != CHAT_PATH {
        return Reply::error(404, "Not found");
    }

    match method {
        Method::Options => Reply::empty(204),
        Method::Post => handle_chat(backend, body).await,
        _ => Reply::error(405, "Method not allowed"),
    }
}

async fn handle_chat(backend: &dyn ChatBackend, body: &str) -> Reply {
    let request: ChatRequest = match serde_json::from_str(body) {
        Ok(request) => request,
        Err(e) => return Reply::error(400, format!("Invalid request body: {e}")),
    };

    match backend.reply(&request).await {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(value) => Reply::json(200, value),
            Err(e) => Reply::error(500, e.to_string()),
        },
        Err(ChatError::EmptyMessage) => Reply::error(400, ChatError::EmptyMessage.to_string()),
        Err(e) => {
            tracing::error!(backend = backend.name(), "Chat reply failed: {e}");
            Reply::error(500, "Failed to generate a reply")
        }
    }
}

/// Read at most [`MAX_BODY_BYTES`] of UTF-8 body.
fn read_body(reader: &mut dyn Read) -> Result<String, Reply> {
    let mut bytes = Vec::new();
    reader
        .take(MAX_BODY_BYTES + 1)
        .read_to_end(&mut bytes)
        .map_err(|e| Reply::error(400, format!("Unreadable body: {e}")))?;

    if bytes.len() as u64 > MAX_BODY_BYTES {
        return Err(Reply::error(413, "Request body too large"));
    }
    String::from_utf8(bytes).map_err(|e| Reply::error(400, format!("Unreadable body: {e}")))
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn into_response(reply: Reply) -> Response<std::io::Cursor<Vec<u8>>> {
    let data = reply.body.map(|b| b.to_string()).unwrap_or_default();
    let mut response = Response::from_string(data).with_status_code(reply.status);

    let headers = [
        ("Content-Type", "application/json"),
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "POST, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type, Authorization"),
    ];
    for (name, value) in headers {
        if let Some(h) = header(name, value) {
            response.add_header(h);
        }
    }
    response
}

/// Stops a running [`ChatServer`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Server>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.unblock();
    }
}

pub struct ChatServer {
    server: Arc<Server>,
    backend: Arc<dyn ChatBackend>,
}

impl ChatServer {
    pub fn bind(addr: &str, backend: Arc<dyn ChatBackend>) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            server: Arc::new(server),
            backend,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.server))
    }

    /// Serve until [`ShutdownHandle::shutdown`] is called.
    pub async fn run(self) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Handle::current();
        let Self { server, backend } = self;

        if let Some(addr) = server.server_addr().to_ip() {
            tracing::info!(%addr, backend = backend.name(), "Chat endpoint listening");
        }

        tokio::task::spawn_blocking(move || {
            for mut request in server.incoming_requests() {
                let method = request.method().clone();
                let url = request.url().to_string();

                let reply = match read_body(request.as_reader()) {
                    Ok(body) => runtime.block_on(route(backend.as_ref(), &method, &url, &body)),
                    Err(reply) => reply,
                };
                tracing::debug!(%method, %url, status = reply.status, "Handled request");

                if let Err(e) = request.respond(into_response(reply)) {
                    tracing::warn!("Failed to send response: {e}");
                }
            }
        })
        .await?;

        tracing::info!("Chat endpoint stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MockBackend;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_chat_reply() {
        let reply = route(
            &MockBackend::new(),
            &Method::Post,
            CHAT_PATH,
            r#"{"message":"streetlight out on 5th","context":{}}"#,
        )
        .await;
        assert_eq!(reply.status, 200);
        let body = reply.body.unwrap();
        assert!(body["response"].as_str().unwrap().contains("streetlight"));
        assert_eq!(body["context_updates"]["last_topic"], "streetlight");
        assert!(body["suggested_actions"].as_array().unwrap().len() >= 1);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let backend = MockBackend::new();

        let reply = route(&backend, &Method::Post, CHAT_PATH, "not json").await;
        assert_eq!(reply.status, 400);

        let reply = route(&backend, &Method::Post, CHAT_PATH, r#"{"message":"  "}"#).await;
        assert_eq!(reply.status, 400);
        assert_eq!(reply.body.unwrap()["error"], "Message is required");

        let reply = route(&backend, &Method::Get, CHAT_PATH, "").await;
        assert_eq!(reply.status, 405);

        let reply = route(&backend, &Method::Post, "/api/other", "{}").await;
        assert_eq!(reply.status, 404);
    }

    #[tokio::test]
    async fn test_preflight_and_query_string() {
        let backend = MockBackend::new();
        let reply = route(&backend, &Method::Options, CHAT_PATH, "").await;
        assert_eq!(reply, Reply::empty(204));

        let url = format!("{CHAT_PATH}?v=2");
        let reply = route(&backend, &Method::Post, &url, r#"{"message":"hello"}"#).await;
        assert_eq!(reply.status, 200);
    }

    #[test]
    fn test_response_headers() {
        let response = into_response(Reply::error(404, "Not found"));
        assert_eq!(response.status_code().0, 404);
        assert!(
            response
                .headers()
                .iter()
                .any(|h| h.field.equiv("Access-Control-Allow-Origin"))
        );
    }

    #[test]
    fn test_body_size_limit() {
        let limit = MAX_BODY_BYTES as usize;

        let mut exact = Cursor::new(vec![b'a'; limit]);
        assert_eq!(read_body(&mut exact).unwrap().len(), limit);

        let mut oversized = Cursor::new(vec![b'a'; limit + 1]);
        let reply = read_body(&mut oversized).unwrap_err();
        assert_eq!(reply.status, 413);

        let mut invalid = Cursor::new(vec![0xff, 0xfe]);
        assert_eq!(read_body(&mut invalid).unwrap_err().status, 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serves_over_http() {
        let server = ChatServer::bind("127.0.0.1:0", Arc::new(MockBackend::new())).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        let response = reqwest::Client::new()
            .post(format!("http://{addr}{CHAT_PATH}"))
            .json(&json!({ "message": "trash was not collected" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["context_updates"]["last_topic"], "sanitation");

        shutdown.shutdown();
        task.await.unwrap().unwrap();
    }
}
