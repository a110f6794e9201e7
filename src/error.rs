//! Error types for the practice pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors raised by providers, storage, and the vault
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{0}")]
    ProviderUnavailable(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("JSON repair failed: {0}")]
    Repair(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Named step of the run pipeline, used to tag errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Input,
    Stt,
    Scoring,
    Db,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Stt => "stt",
            Stage::Scoring => "scoring",
            Stage::Db => "db",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The finite set of ways a run can stop early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunErrorKind {
    /// Malformed body, missing or short audio, missing key for cloud-only mode
    InvalidInput,
    RateLimited,
    NotFound,
    /// Server-side configuration problem (e.g. no encryption secret)
    Misconfigured,
    ProviderUnavailable,
    TranscriptionFailed,
    /// Settings or exercise could not be read
    Storage,
}

impl RunErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            RunErrorKind::InvalidInput => 400,
            RunErrorKind::RateLimited => 429,
            RunErrorKind::NotFound => 404,
            RunErrorKind::Misconfigured | RunErrorKind::Storage => 500,
            RunErrorKind::ProviderUnavailable | RunErrorKind::TranscriptionFailed => 502,
        }
    }
}

/// Fatal pipeline failure: stops the run and maps to a single HTTP status
#[derive(Error, Debug)]
#[error("{stage} stage failed: {message}")]
pub struct RunError {
    pub kind: RunErrorKind,
    pub stage: Stage,
    pub message: String,
    #[source]
    pub cause: Option<Error>,
}

impl RunError {
    pub fn new(kind: RunErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}
