//! Server-wide runtime configuration resolved from the environment

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::providers::HttpTimeouts;
use crate::types::AiMode;

pub const DEFAULT_LOCAL_STT_URL: &str = "http://localhost:7001";
pub const DEFAULT_LOCAL_LLM_URL: &str = "http://localhost:7002";

/// Settings shared by every run
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Fallback mode when neither the user nor the request picks one
    pub ai_mode: AiMode,
    /// Server-wide vendor key used when the user has none stored
    pub default_api_key: Option<String>,
    /// Secret the credential vault derives its key from
    pub encryption_secret: Option<String>,
    pub local_stt_url: String,
    pub local_llm_url: String,
    pub local_stt_model: String,
    pub local_llm_model: String,
    pub cloud_stt_model: String,
    pub cloud_llm_model: String,
    pub environment: String,
    /// Minimum accepted length of the base64 audio payload
    pub min_audio_length: usize,
    pub rate_limit_max: u64,
    pub rate_limit_window: Duration,
    pub health_timeout: Duration,
    pub request_timeout: Duration,
    pub client_cache_capacity: u64,
    pub client_cache_idle: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ai_mode: AiMode::LocalPrefer,
            default_api_key: None,
            encryption_secret: None,
            local_stt_url: DEFAULT_LOCAL_STT_URL.to_string(),
            local_llm_url: DEFAULT_LOCAL_LLM_URL.to_string(),
            local_stt_model: "whisper-large-v3".to_string(),
            local_llm_model: "mlx-community/Mistral-7B-Instruct-v0.2".to_string(),
            cloud_stt_model: "whisper-1".to_string(),
            cloud_llm_model: "gpt-4o-mini".to_string(),
            environment: "production".to_string(),
            min_audio_length: 128,
            rate_limit_max: 10,
            rate_limit_window: Duration::from_millis(60_000),
            health_timeout: Duration::from_millis(2_000),
            request_timeout: Duration::from_millis(120_000),
            client_cache_capacity: 256,
            client_cache_idle: Duration::from_secs(600),
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("ai_mode", &self.ai_mode)
            .field("default_api_key", &self.default_api_key.as_ref().map(|_| "<set>"))
            .field("encryption_secret", &self.encryption_secret.as_ref().map(|_| "<set>"))
            .field("local_stt_url", &self.local_stt_url)
            .field("local_llm_url", &self.local_llm_url)
            .field("environment", &self.environment)
            .field("min_audio_length", &self.min_audio_length)
            .field("rate_limit_max", &self.rate_limit_max)
            .field("rate_limit_window", &self.rate_limit_window)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    /// Read configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // empty values count as unset
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            ai_mode: get("AI_MODE")
                .and_then(|m| AiMode::parse(&m))
                .unwrap_or(defaults.ai_mode),
            default_api_key: get("OPENAI_API_KEY"),
            encryption_secret: get("OPENAI_KEY_ENCRYPTION_SECRET"),
            local_stt_url: get("LOCAL_STT_URL").unwrap_or(defaults.local_stt_url),
            local_llm_url: get("LOCAL_LLM_URL").unwrap_or(defaults.local_llm_url),
            local_stt_model: get("LOCAL_STT_MODEL").unwrap_or(defaults.local_stt_model),
            local_llm_model: get("LOCAL_LLM_MODEL").unwrap_or(defaults.local_llm_model),
            cloud_stt_model: get("OPENAI_STT_MODEL").unwrap_or(defaults.cloud_stt_model),
            cloud_llm_model: get("OPENAI_LLM_MODEL").unwrap_or(defaults.cloud_llm_model),
            environment: get("ENV").unwrap_or(defaults.environment),
            min_audio_length: parse_number(&get, "MIN_AUDIO_LENGTH")?
                .unwrap_or(defaults.min_audio_length),
            rate_limit_max: parse_number(&get, "RATE_LIMIT_MAX")?.unwrap_or(defaults.rate_limit_max),
            rate_limit_window: parse_number(&get, "RATE_LIMIT_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.rate_limit_window),
            health_timeout: parse_number(&get, "HEALTH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_timeout),
            request_timeout: parse_number(&get, "REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            client_cache_capacity: parse_number(&get, "CLIENT_CACHE_CAPACITY")?
                .unwrap_or(defaults.client_cache_capacity),
            client_cache_idle: parse_number(&get, "CLIENT_CACHE_IDLE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.client_cache_idle),
        })
    }

    pub fn debug_enabled(&self) -> bool {
        self.environment == "development"
    }

    pub fn timeouts(&self) -> HttpTimeouts {
        HttpTimeouts {
            health: self.health_timeout,
            request: self.request_timeout,
        }
    }
}

fn parse_number<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    get(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| Error::Config(format!("{name} must be a non-negative integer, got {raw:?}")))
        })
        .transpose()
}
