//! Practice - speech-to-text and rubric scoring for recorded practice responses
//!
//! A run transcribes the caller's audio, scores the transcript against the
//! exercise rubric, and persists the attempt. Each capability can be served by
//! a self-hosted local backend or a cloud vendor, chosen per run by health and
//! the user's routing mode.

pub mod config;
pub mod error;
pub mod logging;
pub mod migrations;
pub mod pipeline;
pub mod providers;
pub mod rate_limit;
pub mod repair;
pub mod selector;
pub mod storage;
pub mod types;
pub mod validate;
pub mod vault;

pub use error::{Error, Result, RunError, RunErrorKind, Stage};
pub use types::*;

/// Re-export the main pipeline components for convenience
pub use config::RuntimeConfig;
pub use pipeline::{Caller, PracticeRunner, RunReply, RunRequest, RunResponse};
pub use providers::{HttpProviderFactory, LlmProvider, ProviderFactory, SttProvider};
pub use rate_limit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter};
pub use repair::{HeuristicRepair, JsonRepair};
pub use storage::{AttemptStore, ExerciseStore, PracticeStore, SettingsStore, Storage, UserSettings};
pub use vault::CredentialRecord;
