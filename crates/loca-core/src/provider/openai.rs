//! OpenAI Chat Completions adapter.
//!
//! System messages stay inline in `messages`. [`ChatCompletionsClient`] is
//! shared with other backends that speak the same protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http::{self, Flow, SseHandler};
use super::types::{CompletionRequest, CompletionResponse, Role, Usage};
use super::Provider;

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatCompletionsClient {
    backend: &'static str,
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(backend: &'static str, api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            backend,
            api_key: api_key.into(),
            base_url: base_url.to_owned(),
            http: reqwest::Client::new(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = ChatRequest::from_canonical(request, stream);
        let mut headers = http::base_headers(stream);
        http::insert_secret(
            &mut headers,
            self.backend,
            "authorization",
            &format!("Bearer {}", self.api_key),
        )?;

        let url = http::join_url(&self.base_url, CHAT_COMPLETIONS_PATH);
        http::post_json(&self.http, self.backend, &url, headers, &body).await
    }

    pub async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, false).await?;
        let body: ChatResponse = http::read_json(self.backend, response).await?;
        body.into_canonical(self.backend)
    }

    pub async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, true).await?;
        let mut state = ChatStream::new(self.backend, &request.model);
        http::drive_sse(self.backend, response.bytes_stream(), &mut state, on_delta).await?;
        state.finish()
    }
}

/// Adapter for OpenAI models.
pub struct OpenAiProvider {
    client: ChatCompletionsClient,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client: ChatCompletionsClient::new(
                "openai",
                api_key,
                base_url.unwrap_or(DEFAULT_BASE_URL),
            ),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.client.backend()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.client.complete(request).await
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        self.client.stream_complete(request, on_delta).await
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> ChatRequest<'a> {
    fn from_canonical(request: &'a CompletionRequest, stream: bool) -> Self {
        let messages = request
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                content: &m.content,
            })
            .collect();

        Self {
            model: &request.model,
            messages,
            max_tokens: request.max_tokens_or_default(),
            temperature: request.temperature_or_default(),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
        .normalized()
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn into_canonical(self, backend: &str) -> Result<CompletionResponse, ProviderError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::parse(backend, "response contained no choices"))?;
        check_finish_reason(backend, choice.finish_reason.as_deref())?;

        Ok(CompletionResponse {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            usage: Some(self.usage.unwrap_or_default().into()),
        })
    }
}

fn check_finish_reason(backend: &str, reason: Option<&str>) -> Result<(), ProviderError> {
    match reason {
        Some("content_filter") => Err(ProviderError::api(
            backend,
            "completion stopped by content filter",
        )),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Accumulates a Chat Completions chunk stream.
#[derive(Debug)]
pub(crate) struct ChatStream {
    backend: &'static str,
    content: String,
    model: String,
    usage: Usage,
    finished: bool,
}

impl ChatStream {
    pub(crate) fn new(backend: &'static str, model: &str) -> Self {
        Self {
            backend,
            content: String::new(),
            model: model.to_owned(),
            usage: Usage::default(),
            finished: false,
        }
    }

    /// Build the response. Fails unless the `[DONE]` sentinel was seen.
    pub(crate) fn finish(self) -> Result<CompletionResponse, ProviderError> {
        if !self.finished {
            return Err(ProviderError::api(
                self.backend,
                "stream ended before completion",
            ));
        }
        Ok(CompletionResponse {
            content: self.content,
            model: self.model,
            usage: Some(self.usage),
        })
    }
}

impl SseHandler for ChatStream {
    fn on_event(
        &mut self,
        _event: &str,
        data: &str,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Flow, ProviderError> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return Ok(Flow::Continue);
        }
        if trimmed == "[DONE]" {
            self.finished = true;
            return Ok(Flow::Done);
        }

        let chunk: StreamChunk = http::parse_json(self.backend, trimmed, "stream chunk")?;
        if let Some(error) = chunk.error {
            return Err(ProviderError::api(
                self.backend,
                format!(
                    "{}: {}",
                    error.kind.as_deref().unwrap_or("error"),
                    error.message.as_deref().unwrap_or("unknown error"),
                ),
            ));
        }
        if let Some(model) = chunk.model {
            self.model = model;
        }
        if let Some(usage) = chunk.usage {
            self.usage = usage.into();
        }
        for choice in chunk.choices {
            check_finish_reason(self.backend, choice.finish_reason.as_deref())?;
            if let Some(text) = choice.delta.and_then(|d| d.content) {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    on_delta(&text);
                }
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;
    use crate::provider::http::testing::{chunked, collector};
    use crate::provider::types::Message;

    const SSE_CHUNKS: &str = r#"data: {"id":"c1","object":"chat.completion.chunk","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}

data: {"id":"c1","object":"chat.completion.chunk","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}

data: {"id":"c1","object":"chat.completion.chunk","model":"gpt-4o-mini","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":"stop"}]}

data: {"id":"c1","object":"chat.completion.chunk","model":"gpt-4o-mini","choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}

data: [DONE]

"#;

    #[tokio::test]
    async fn stream_aggregates_until_done() {
        let mut state = ChatStream::new("openai", "gpt-4o-mini");
        let mut deltas = Vec::new();
        let mut on_delta = collector(&mut deltas);

        http::drive_sse("openai", chunked(SSE_CHUNKS), &mut state, &mut on_delta)
            .await
            .unwrap();
        drop(on_delta);

        let response = state.finish().unwrap();
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert_eq!(response.content, "Hello");
        assert_eq!(response.usage, Some(Usage::new(9, 2)));
    }

    #[tokio::test]
    async fn stream_cut_before_done_is_an_error() {
        let body = "data: {\"model\":\"deepseek-chat\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"The answer is\"},\"finish_reason\":null}]}\n\n";
        let mut state = ChatStream::new("deepseek", "deepseek-chat");
        let mut deltas = Vec::new();
        let mut on_delta = collector(&mut deltas);
        http::drive_sse("deepseek", chunked(body), &mut state, &mut on_delta)
            .await
            .unwrap();
        drop(on_delta);

        assert_eq!(deltas, vec!["The answer is"]);
        let err = state.finish().unwrap_err();
        assert_eq!(err.backend, "deepseek");
        assert_eq!(err.kind, ProviderErrorKind::Api);
        assert_eq!(err.message, "stream ended before completion");
    }

    #[tokio::test]
    async fn stream_error_chunk_fails() {
        let body = "data: {\"error\":{\"type\":\"rate_limit_exceeded\",\"message\":\"slow down\"}}\n\n";
        let mut state = ChatStream::new("deepseek", "deepseek-chat");
        let mut sink = |_: &str| {};

        let err = http::drive_sse("deepseek", chunked(body), &mut state, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.backend, "deepseek");
        assert_eq!(err.kind, ProviderErrorKind::Api);
        assert_eq!(err.message, "rate_limit_exceeded: slow down");
    }

    #[tokio::test]
    async fn malformed_chunk_is_parse_error() {
        let mut state = ChatStream::new("openai", "m");
        let mut sink = |_: &str| {};
        let err = http::drive_sse("openai", chunked("data: {not json\n\n"), &mut state, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Parse);
    }

    #[test]
    fn request_keeps_system_inline() {
        let request = CompletionRequest {
            messages: vec![Message::system("persona"), Message::user("hi")],
            model: "gpt-4o-mini".into(),
            max_tokens: None,
            temperature: Some(0.1),
            stream: true,
        };
        let body = serde_json::to_value(ChatRequest::from_canonical(&request, true)).unwrap();

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "persona");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["temperature"], 0.1);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn blocking_request_has_no_stream_options() {
        let request = CompletionRequest::new("m", vec![Message::user("hi")]);
        let body = serde_json::to_value(ChatRequest::from_canonical(&request, false)).unwrap();
        assert!(body.get("stream_options").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn blocking_response_without_usage_reports_zero() {
        let raw = r#"{"model":"gpt-4o-mini","choices":[{"index":0,"message":{"role":"assistant","content":"4"},"finish_reason":"stop"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let response = parsed.into_canonical("openai").unwrap();
        assert_eq!(response.content, "4");
        assert_eq!(response.usage, Some(Usage::default()));
    }

    #[test]
    fn empty_choices_is_parse_error() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        let err = parsed.into_canonical("openai").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Parse);
    }

    #[test]
    fn content_filter_is_api_error() {
        let raw = r#"{"choices":[{"message":{"content":""},"finish_reason":"content_filter"}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.into_canonical("openai").unwrap_err().kind,
            ProviderErrorKind::Api
        );
    }
}
