//! DeepSeek adapter. DeepSeek speaks the Chat Completions protocol, so this
//! is the OpenAI client pointed at a different default endpoint.

use async_trait::async_trait;

use super::error::ProviderError;
use super::openai::ChatCompletionsClient;
use super::types::{CompletionRequest, CompletionResponse};
use super::Provider;

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

/// Adapter for DeepSeek models.
pub struct DeepSeekProvider {
    client: ChatCompletionsClient,
}

impl DeepSeekProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client: ChatCompletionsClient::new(
                "deepseek",
                api_key,
                base_url.unwrap_or(DEFAULT_BASE_URL),
            ),
        }
    }
}

#[async_trait]
impl Provider for DeepSeekProvider {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_deepseek_backend_name() {
        let provider = DeepSeekProvider::new("sk-test", None);
        assert_eq!(provider.name(), "deepseek");
    }
}
