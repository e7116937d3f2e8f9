//! Upstream LLM via an OpenAI-compatible chat completions API.

use super::{ChatBackend, ChatError, ChatRequest, ChatResponse, Topic};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// HTTP request timeout.
const TIMEOUT: Duration = Duration::from_secs(60);
/// Connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TOKENS: u32 = 500;

pub struct LiveBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
}

impl LiveBackend {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str, model: &str, system_prompt: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages = vec![json!({ "role": "system", "content": self.system_prompt })];

        let has_context = match &request.context {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if has_context {
            messages.push(json!({
                "role": "system",
                "content": format!("Conversation context: {}", request.context),
            }));
        }
        messages.push(json!({ "role": "user", "content": request.message }));

        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
        })
    }
}

impl std::fmt::Debug for LiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Extract the first choice's text from a completions response body.
fn parse_completion(body: &str) -> Result<String, ChatError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ChatError::InvalidResponse(format!("{e}: {body}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| ChatError::InvalidResponse("no content in first choice".into()))
}

/// Wrap model text with the same actions the canned replies would offer.
fn build_response(message: &str, text: String) -> ChatResponse {
    match Topic::detect(message) {
        Some(topic) => ChatResponse {
            response: text,
            suggested_actions: topic.suggested_actions(),
            context_updates: json!({ "last_topic": topic.id() }),
        },
        None => ChatResponse {
            response: text,
            suggested_actions: Vec::new(),
            context_updates: json!({}),
        },
    }
}

#[async_trait]
impl ChatBackend for LiveBackend {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn reply(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError> {
        request.validate()?;

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(url = %url, model = %self.model, "Sending chat completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Api(format!("HTTP {status}: {body}")));
        }

        let text = parse_completion(&body)?;
        Ok(build_response(&request.message, text))
    }
}
