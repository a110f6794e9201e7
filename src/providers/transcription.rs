//! Speech-to-text provider trait and types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::Provider;

/// Request for transcription
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    /// Base64-encoded audio as submitted by the caller
    pub audio_base64: String,
    /// Optional language hint (ISO 639-1 code, e.g., "en")
    pub language: Option<String>,
}

impl TranscriptionRequest {
    pub fn new(audio_base64: impl Into<String>) -> Self {
        Self {
            audio_base64: audio_base64.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Transcript returned by an STT backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<TranscriptWord>>,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            confidence: None,
            language: None,
            words: None,
        }
    }
}

/// A word with optional timing and probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    pub w: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
}

/// Trait for speech-to-text providers
#[async_trait]
pub trait SttProvider: Provider {
    /// Transcribe audio to text
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript>;
}
