//! Gemini Generative Language API adapter.
//!
//! System content goes to `systemInstruction`; assistant turns use the
//! `model` role.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http::{self, Flow, SseHandler};
use super::types::{CompletionRequest, CompletionResponse, Role, Usage};
use super::Provider;

const BACKEND: &str = "gemini";

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Finish reasons that mean the backend withheld the answer.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// Adapter for Gemini models.
pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl GeminiProvider {
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
        let body = GenerateRequest::from_canonical(request);
        let mut headers = http::base_headers(stream);
        http::insert_secret(&mut headers, BACKEND, "x-goog-api-key", &self.api_key)?;

        let path = if stream {
            format!("/v1beta/models/{}:streamGenerateContent?alt=sse", request.model)
        } else {
            format!("/v1beta/models/{}:generateContent", request.model)
        };
        let url = http::join_url(&self.base_url, &path);
        http::post_json(&self.http, BACKEND, &url, headers, &body).await
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, false).await?;
        let body: GenerateResponse = http::read_json(BACKEND, response).await?;

        let mut state = GeminiStream::new(&request.model);
        state.absorb(body, &mut |_: &str| {})?;
        state.finish()
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.send(request, true).await?;
        let mut state = GeminiStream::new(&request.model);
        http::drive_sse(BACKEND, response.bytes_stream(), &mut state, on_delta).await?;
        state.finish()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<OwnedPart>,
}

#[derive(Debug, Serialize)]
struct OwnedPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f64,
}

impl<'a> GenerateRequest<'a> {
    fn from_canonical(request: &'a CompletionRequest) -> Self {
        let contents = request
            .conversation()
            .map(|m| Content {
                role: if m.role == Role::Assistant {
                    "model"
                } else {
                    "user"
                },
                parts: vec![Part { text: &m.content }],
            })
            .collect();

        Self {
            contents,
            system_instruction: request.system_prompt().map(|text| SystemInstruction {
                parts: vec![OwnedPart { text }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens_or_default(),
                temperature: request.temperature_or_default(),
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Accumulates `generateContent` responses. The blocking endpoint returns
/// one of these; the streaming endpoint sends one per SSE event.
#[derive(Debug)]
pub(crate) struct GeminiStream {
    content: String,
    model: String,
    usage: Usage,
    finished: bool,
}

impl GeminiStream {
    pub(crate) fn new(model: &str) -> Self {
        Self {
            content: String::new(),
            model: model.to_owned(),
            usage: Usage::default(),
            finished: false,
        }
    }

    fn absorb(
        &mut self,
        chunk: GenerateResponse,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<(), ProviderError> {
        if let Some(error) = chunk.error {
            return Err(ProviderError::api(
                BACKEND,
                format!(
                    "{}: {}",
                    error.status.as_deref().unwrap_or("error"),
                    error.message.as_deref().unwrap_or("unknown error"),
                ),
            ));
        }
        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::api(
                BACKEND,
                format!("prompt blocked: {reason}"),
            ));
        }
        if let Some(version) = chunk.model_version {
            self.model = version;
        }
        if let Some(usage) = chunk.usage_metadata {
            self.usage = Usage {
                prompt_tokens: usage.prompt_token_count,
                completion_tokens: usage.candidates_token_count,
                total_tokens: usage.total_token_count,
            }
            .normalized();
        }

        if let Some(candidate) = chunk.candidates.into_iter().next() {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                if BLOCKING_FINISH_REASONS.contains(&reason) {
                    return Err(ProviderError::api(
                        BACKEND,
                        format!("response blocked: {reason}"),
                    ));
                }
                self.finished = true;
            }
            let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
            for text in parts.into_iter().filter_map(|p| p.text) {
                if !text.is_empty() {
                    self.content.push_str(&text);
                    on_delta(&text);
                }
            }
        }
        Ok(())
    }

    /// Build the response. Fails unless a candidate reported a finish reason.
    pub(crate) fn finish(self) -> Result<CompletionResponse, ProviderError> {
        if !self.finished {
            return Err(ProviderError::api(BACKEND, "stream ended before completion"));
        }
        Ok(CompletionResponse {
            content: self.content,
            model: self.model,
            usage: Some(self.usage),
        })
    }
}

impl SseHandler for GeminiStream {
    fn on_event(
        &mut self,
        _event: &str,
        data: &str,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<Flow, ProviderError> {
        if data.trim().is_empty() {
            return Ok(Flow::Continue);
        }
        let chunk: GenerateResponse = http::parse_json(BACKEND, data, "stream chunk")?;
        self.absorb(chunk, on_delta)?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderErrorKind;
    use crate::provider::http::testing::{chunked, collector};
    use crate::provider::types::Message;

    const SSE_BODY: &str = r#"data: {"candidates":[{"content":{"parts":[{"text":"The answer"}],"role":"model"},"index":0}],"usageMetadata":{"promptTokenCount":8,"totalTokenCount":8},"modelVersion":"gemini-2.0-flash"}

data: {"candidates":[{"content":{"parts":[{"text":" is 4."}],"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":5,"totalTokenCount":13},"modelVersion":"gemini-2.0-flash"}

"#;

    #[tokio::test]
    async fn stream_aggregates_parts() {
        let mut state = GeminiStream::new("gemini-2.0-flash");
        let mut deltas = Vec::new();
        let mut on_delta = collector(&mut deltas);

        http::drive_sse(BACKEND, chunked(SSE_BODY), &mut state, &mut on_delta)
            .await
            .unwrap();
        drop(on_delta);

        let response = state.finish().unwrap();
        assert_eq!(deltas, vec!["The answer", " is 4."]);
        assert_eq!(response.content, "The answer is 4.");
        assert_eq!(response.usage, Some(Usage::new(8, 5)));
    }

    #[tokio::test]
    async fn stream_without_finish_reason_is_an_error() {
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"The answer\"}]},\"index\":0}]}\n\n";
        let mut state = GeminiStream::new("m");
        let mut sink = |_: &str| {};
        http::drive_sse(BACKEND, chunked(body), &mut state, &mut sink)
            .await
            .unwrap();

        let err = state.finish().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Api);
        assert_eq!(err.message, "stream ended before completion");
    }

    #[tokio::test]
    async fn safety_finish_is_api_error() {
        let body = "data: {\"candidates\":[{\"finishReason\":\"SAFETY\",\"index\":0}]}\n\n";
        let mut state = GeminiStream::new("m");
        let mut sink = |_: &str| {};
        let err = http::drive_sse(BACKEND, chunked(body), &mut state, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Api);
        assert_eq!(err.message, "response blocked: SAFETY");
    }

    #[tokio::test]
    async fn error_object_is_api_error() {
        let body = "data: {\"error\":{\"code\":429,\"message\":\"quota\",\"status\":\"RESOURCE_EXHAUSTED\"}}\n\n";
        let mut state = GeminiStream::new("m");
        let mut sink = |_: &str| {};
        let err = http::drive_sse(BACKEND, chunked(body), &mut state, &mut sink)
            .await
            .unwrap_err();
        assert_eq!(err.message, "RESOURCE_EXHAUSTED: quota");
    }

    #[test]
    fn request_uses_system_instruction_and_model_role() {
        let request = CompletionRequest {
            messages: vec![
                Message::system("persona"),
                Message::user("q1"),
                Message::assistant("a1"),
                Message::user("q2"),
            ],
            model: "gemini-2.0-flash".into(),
            max_tokens: Some(100),
            temperature: None,
            stream: false,
        };
        let body = serde_json::to_value(GenerateRequest::from_canonical(&request)).unwrap();

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "persona");
        let roles: Vec<&str> = body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
    }

    #[test]
    fn blocking_response_without_usage_reports_zero() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]},"finishReason":"STOP"}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let mut state = GeminiStream::new("gemini-2.0-flash");
        state.absorb(parsed, &mut |_: &str| {}).unwrap();
        let response = state.finish().unwrap();
        assert_eq!(response.content, "hi");
        assert_eq!(response.model, "gemini-2.0-flash");
        assert_eq!(response.usage, Some(Usage::default()));
    }
}
