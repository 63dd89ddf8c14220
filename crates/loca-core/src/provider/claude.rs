//! Anthropic Messages API adapter.
//!
//! System-role messages are lifted into the top-level `system` field;
//! the remaining turns are sent as `messages`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http::{self, Flow, SseHandler};
use super::types::{CompletionRequest, CompletionResponse, Role, Usage};
use super::Provider;

const BACKEND: &str = "claude";

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Value of the `anthropic-version` header.
pub const API_VERSION: &str = "2023-06-01";

const MESSAGES_PATH: &str = "/v1/messages";

/// Adapter for Claude models.
pub struct ClaudeProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl ClaudeProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).to_owned(),
            http: reqwest::Client::new(),
        }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = MessagesRequest::from_canonical(request, stream);
        let mut headers = http::base_headers(stream);
        http::insert_secret(&mut headers, BACKEND, "x-api-key", &self.api_key)?;
        http::insert_secret(&mut headers, BACKEND, "anthropic-version", API_VERSION)?;

        let url = http::join_url(&self.base_url, MESSAGES_PATH);
        http::post_json(&self.http, BACKEND, &url, headers, &body).await
    }
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, false).await?;
        let body: MessagesResponse = http::read_json(BACKEND, response).await?;
        body.into_canonical()
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, true).await?;
        let mut state = ClaudeStream::new(&request.model);
        http::drive_sse(BACKEND, response.bytes_stream(), &mut state, on_delta).await?;
        state.finish()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> MessagesRequest<'a> {
    fn from_canonical(request: &'a CompletionRequest, stream: bool) -> Self {
        let messages = request
            .conversation()
            .map(|m| WireMessage {
                role: if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content: &m.content,
            })
            .collect();

        Self {
            model: &request.model,
            max_tokens: request.max_tokens_or_default(),
            temperature: request.temperature_or_default(),
            system: request.system_prompt(),
            messages,
            stream,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    fn into_canonical(self) -> Result<CompletionResponse, ProviderError> {
        check_stop_reason(self.stop_reason.as_deref())?;
        let content = self
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<String>();
        let usage = self.usage.unwrap_or_default();
        Ok(CompletionResponse {
            content,
            model: self.model,
            usage: Some(Usage::new(usage.input_tokens, usage.output_tokens)),
        })
    }
}

fn check_stop_reason(reason: Option<&str>) -> Result<(), ProviderError> {
    match reason {
        Some("refusal") => Err(ProviderError::api(BACKEND, "model refused the request")),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Accumulates a Messages API event stream.
#[derive(Debug)]
pub(crate) struct ClaudeStream {
    content: String,
    model: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    finished: bool,
}

impl ClaudeStream {
    pub(crate) fn new(model: &str) -> Self {
        Self {
            content: String::new(),
            model: model.to_owned(),
            prompt_tokens: 0,
            completion_tokens: 0,
            finished: false,
        }
    }

    /// Build the response. Fails unless `message_stop` was seen.
    pub(crate) fn finish(self) -> Result<CompletionResponse, ProviderError> {
        if !self.finished {
            return Err(ProviderError::api(BACKEND, "stream ended before completion"));
        }
        Ok(CompletionResponse {
            content: self.content,
            model: self.model,
            usage: Some(Usage::new(self.prompt_tokens, self.completion_tokens)),
        })
    }
}

impl SseHandler for ClaudeStream {
    fn on_event(
        &mut self,
        _event: &str,
        data: &str,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Flow, ProviderError> {
        if data.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        let frame: StreamFrame = http::parse_json(BACKEND, data, "stream event")?;

        match frame.kind.as_str() {
            "message_start" => {
                if let Some(message) = frame.message {
                    if let Some(model) = message.model {
                        self.model = model;
                    }
                    if let Some(usage) = message.usage {
                        self.prompt_tokens = usage.input_tokens;
                    }
                }
            }
            "content_block_delta" => {
                if let Some(StreamDelta {
                    kind: Some(kind),
                    text: Some(text),
                    ..
                }) = frame.delta
                {
                    if kind == "text_delta" {
                        self.content.push_str(&text);
                        on_delta(&text);
                    }
                }
            }
            "message_delta" => {
                if let Some(delta) = &frame.delta {
                    check_stop_reason(delta.stop_reason.as_deref())?;
                }
                if let Some(usage) = frame.usage {
                    self.completion_tokens = usage.output_tokens;
                }
            }
            "message_stop" => {
                self.finished = true;
                return Ok(Flow::Done);
            }
            "error" => {
                let error = frame.error.unwrap_or(StreamError {
                    kind: None,
                    message: None,
                });
                return Err(ProviderError::api(
                    BACKEND,
                    format!(
                        "{}: {}",
                        error.kind.as_deref().unwrap_or("error"),
                        error.message.as_deref().unwrap_or("unknown error"),
                    ),
                ));
            }
            // ping, content_block_start, content_block_stop
            _ => {}
        }
        Ok(Flow::Continue)
    }
}
