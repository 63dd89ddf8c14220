//! Provider registry: resolves and caches adapter instances.
//!
//! Adapters are keyed by backend, base URL and a truncated SHA-256
//! fingerprint of the API key, so agents that share credentials and an
//! endpoint share one HTTP client. The registry is an explicit object injected into the
//! runner and the workflow engine; there is no process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use loca_db::models::ProviderKind;
use sha2::{Digest, Sha256};

use super::claude::ClaudeProvider;
use super::deepseek::DeepSeekProvider;
use super::gemini::GeminiProvider;
use super::openai::OpenAiProvider;
use super::Provider;

/// Number of hex digits of the key digest kept in the cache key.
const FINGERPRINT_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    kind: ProviderKind,
    fingerprint: String,
    base_url: Option<String>,
}

/// A cache of [`Provider`] adapters keyed by backend, endpoint and
/// credential fingerprint.
///
/// # Example
///
/// ```ignore
/// let registry = ProviderRegistry::new();
/// let provider = registry.get_or_create(ProviderKind::Claude, &api_key, None);
/// let response = provider.complete(&request).await?;
/// ```
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<HashMap<CacheKey, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached adapter for `(kind, api_key, base_url)`,
    /// constructing it on first use.
    pub fn get_or_create(
        &self,
        kind: ProviderKind,
        api_key: &str,
        base_url: Option<&str>,
    ) -> Arc<dyn Provider> {
        let key = cache_key(kind, api_key, base_url);
        let mut providers = self.lock();
        providers
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(provider = %kind, "constructing provider adapter");
                build(kind, api_key, base_url)
            })
            .clone()
    }

    /// Pre-seed the cache with an adapter. Returns the adapter it replaced.
    pub fn register(
        &self,
        kind: ProviderKind,
        api_key: &str,
        base_url: Option<&str>,
        provider: Arc<dyn Provider>,
    ) -> Option<Arc<dyn Provider>> {
        self.lock()
            .insert(cache_key(kind, api_key, base_url), provider)
    }

    /// Drop every cached adapter.
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Return the number of cached adapters.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Return `true` if no adapters are cached.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<dyn Provider>>> {
        // The map is never left half-updated, so a poisoned lock is usable.
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .lock()
            .keys()
            .map(|key| match &key.base_url {
                Some(url) => format!("{}-{}@{url}", key.kind, key.fingerprint),
                None => format!("{}-{}", key.kind, key.fingerprint),
            })
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &keys)
            .finish()
    }
}

fn cache_key(kind: ProviderKind, api_key: &str, base_url: Option<&str>) -> CacheKey {
    let mut fingerprint = hex::encode(Sha256::digest(api_key.as_bytes()));
    fingerprint.truncate(FINGERPRINT_LEN);
    CacheKey {
        kind,
        fingerprint,
        base_url: base_url.map(|url| url.trim_end_matches('/').to_owned()),
    }
}

fn build(kind: ProviderKind, api_key: &str, base_url: Option<&str>) -> Arc<dyn Provider> {
    match kind {
        ProviderKind::Claude => Arc::new(ClaudeProvider::new(api_key, base_url)),
        ProviderKind::Openai => Arc::new(OpenAiProvider::new(api_key, base_url)),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(api_key, base_url)),
        ProviderKind::Deepseek => Arc::new(DeepSeekProvider::new(api_key, base_url)),
    }
}
