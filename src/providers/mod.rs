//! Provider abstraction layer for speech-to-text and evaluation backends
//!
//! Each capability has a self-hosted local implementation and a cloud vendor
//! implementation behind the same trait.
mod client_cache;
mod evaluation;
mod factory;
mod local;
mod openai;
#[cfg(test)]
pub(crate) mod test_support;
mod transcription;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Response;

use crate::error::{Error, Result};
use crate::logging::{BODY_PREVIEW_CHARS, truncate};
use crate::types::{ProviderKind, ProviderSelection};

pub use client_cache::{ClientCache, cache_key};
pub use evaluation::{EvaluationInput, LlmProvider, RawEvaluation, StructuredTask};
pub use factory::{HttpProviderFactory, ProviderContext, ProviderFactory, ProviderPair};
pub use local::{LocalLlmProvider, LocalSttProvider};
pub use openai::{
    KeyValidation, OPENAI_API_BASE, OpenAiLlmProvider, OpenAiSttProvider, validate_api_key,
};
pub use transcription::{SttProvider, Transcript, TranscriptWord, TranscriptionRequest};

/// Capability a provider serves, used in selection messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Stt,
    Llm,
}

impl Capability {
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Stt => "STT",
            Capability::Llm => "LLM",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Behavior shared by every backend regardless of capability
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    /// Whether the backend can take a call right now
    async fn health_check(&self) -> bool;

    fn selection(&self) -> ProviderSelection {
        ProviderSelection {
            kind: self.kind(),
            model: self.model().to_string(),
        }
    }
}

/// Per-request deadlines for backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// Health probes
    pub health: Duration,
    /// Transcription and evaluation
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            health: Duration::from_secs(2),
            request: Duration::from_secs(120),
        }
    }
}

/// Pass 2xx responses through; turn anything else into a typed HTTP error
pub(crate) async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Http {
        status: status.as_u16(),
        body: truncate(&body, BODY_PREVIEW_CHARS),
    })
}
