//! Builds the local/cloud provider pair for each capability

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::logging::redact_key;

use super::{
    ClientCache, HttpTimeouts, KeyValidation, LlmProvider, LocalLlmProvider, LocalSttProvider,
    OPENAI_API_BASE, OpenAiLlmProvider, OpenAiSttProvider, SttProvider, validate_api_key,
};

/// The two candidate backends for one capability
pub struct ProviderPair<P: ?Sized> {
    pub local: Arc<P>,
    pub cloud: Arc<P>,
}

impl<P: ?Sized> Clone for ProviderPair<P> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            cloud: self.cloud.clone(),
        }
    }
}

/// Request-scoped inputs for building providers
///
/// Holds the decrypted key only for the lifetime of one run.
#[derive(Clone, Default)]
pub struct ProviderContext {
    pub local_stt_url: String,
    pub local_llm_url: String,
    pub api_key: Option<String>,
}

impl ProviderContext {
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("local_stt_url", &self.local_stt_url)
            .field("local_llm_url", &self.local_llm_url)
            .field("api_key", &self.api_key.as_deref().map(redact_key))
            .finish()
    }
}

/// Source of provider instances for the run pipeline
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    fn stt_providers(&self, ctx: &ProviderContext) -> Result<ProviderPair<dyn SttProvider>>;

    fn llm_providers(&self, ctx: &ProviderContext) -> Result<ProviderPair<dyn LlmProvider>>;

    /// Check a vendor key against the cloud backend
    async fn validate_key(&self, api_key: &str) -> KeyValidation;
}

/// Production factory: HTTP backends on cached clients
pub struct HttpProviderFactory {
    cache: ClientCache,
    timeouts: HttpTimeouts,
    cloud_base_url: String,
    local_stt_model: String,
    local_llm_model: String,
    cloud_stt_model: String,
    cloud_llm_model: String,
}

impl HttpProviderFactory {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            cache: ClientCache::new(config.client_cache_capacity, config.client_cache_idle),
            timeouts: HttpTimeouts {
                health: config.health_timeout,
                request: config.request_timeout,
            },
            cloud_base_url: OPENAI_API_BASE.to_string(),
            local_stt_model: config.local_stt_model.clone(),
            local_llm_model: config.local_llm_model.clone(),
            cloud_stt_model: config.cloud_stt_model.clone(),
            cloud_llm_model: config.cloud_llm_model.clone(),
        }
    }

    pub fn with_cloud_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.cloud_base_url = base_url.into();
        self
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn timeouts(&self) -> HttpTimeouts {
        self.timeouts
    }

    pub fn cloud_base_url(&self) -> &str {
        &self.cloud_base_url
    }

    fn cloud_client(&self, ctx: &ProviderContext) -> Result<(reqwest::Client, bool)> {
        let key = ctx.api_key.as_deref().filter(|k| !k.is_empty());
        let client = self.cache.get_or_create(&self.cloud_base_url, key)?;
        Ok((client, key.is_some()))
    }
}

#[async_trait]
impl ProviderFactory for HttpProviderFactory {
    fn stt_providers(&self, ctx: &ProviderContext) -> Result<ProviderPair<dyn SttProvider>> {
        let local_client = self.cache.get_or_create(&ctx.local_stt_url, None)?;
        let (cloud_client, has_key) = self.cloud_client(ctx)?;

        let local: Arc<dyn SttProvider> = Arc::new(
            LocalSttProvider::new(local_client, &ctx.local_stt_url, &self.local_stt_model)
                .with_timeouts(self.timeouts),
        );
        let cloud: Arc<dyn SttProvider> = Arc::new(
            OpenAiSttProvider::new(cloud_client, has_key)
                .with_model(&self.cloud_stt_model)
                .with_base_url(&self.cloud_base_url)
                .with_timeouts(self.timeouts),
        );
        Ok(ProviderPair { local, cloud })
    }

    fn llm_providers(&self, ctx: &ProviderContext) -> Result<ProviderPair<dyn LlmProvider>> {
        let local_client = self.cache.get_or_create(&ctx.local_llm_url, None)?;
        let (cloud_client, has_key) = self.cloud_client(ctx)?;

        let local: Arc<dyn LlmProvider> = Arc::new(
            LocalLlmProvider::new(local_client, &ctx.local_llm_url, &self.local_llm_model)
                .with_timeouts(self.timeouts),
        );
        let cloud: Arc<dyn LlmProvider> = Arc::new(
            OpenAiLlmProvider::new(cloud_client, has_key)
                .with_model(&self.cloud_llm_model)
                .with_base_url(&self.cloud_base_url)
                .with_timeouts(self.timeouts),
        );
        Ok(ProviderPair { local, cloud })
    }

    async fn validate_key(&self, api_key: &str) -> KeyValidation {
        let client = match self.cache.get_or_create(&self.cloud_base_url, Some(api_key)) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Could not build validation client");
                return KeyValidation::failed("API key contains invalid characters.");
            }
        };
        validate_api_key(&client, &self.cloud_base_url, self.timeouts).await
    }
}
