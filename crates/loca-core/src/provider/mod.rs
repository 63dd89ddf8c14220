//! Provider adapters: one implementation per LLM backend behind a common
//! [`Provider`] trait.
//!
//! # Architecture
//!
//! ```text
//! TaskRunner / WorkflowEngine
//!     |
//!     v
//! ProviderRegistry --get_or_create(kind, api_key, base_url)--> Arc<dyn Provider>
//!                                                                  |
//!     complete(request) -------------------------------------------+
//!     stream_complete(request, on_delta) --> on_delta("fragment") ...
//!                                        --> CompletionResponse
//! ```

pub mod claude;
pub mod deepseek;
pub mod error;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod registry;
pub mod types;

use async_trait::async_trait;

pub use claude::ClaudeProvider;
pub use deepseek::DeepSeekProvider;
pub use error::{ProviderError, ProviderErrorKind};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use registry::ProviderRegistry;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, Usage};

/// Adapter interface for an LLM backend.
///
/// # Object Safety
///
/// This trait is object-safe so adapters can be shared as
/// `Arc<dyn Provider>` through the [`ProviderRegistry`]. Adapters hold no
/// per-call state and are used concurrently without locking.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name used in errors and logs (e.g. "claude").
    fn name(&self) -> &str;

    /// Run a blocking completion.
    async fn complete(&self, request: &CompletionRequest)
    -> Result<CompletionResponse, ProviderError>;

    /// Run a streaming completion, calling `on_delta` with each text
    /// fragment in arrival order. Returns the aggregated response.
    ///
    /// The default adapts a blocking-only backend by emitting the full
    /// content as a single terminal fragment.
    async fn stream_complete(
        &self,
        request: &CompletionRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d str) + Send),
    ) -> Result<CompletionResponse, ProviderError> {
        let response = self.complete(request).await?;
        on_delta(&response.content);
        Ok(response)
    }
}

// Compile-time assertion: Provider must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Provider) {}
};
