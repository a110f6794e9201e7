//! The practice run pipeline
//!
//! One run goes input → rate limit → context → exercise → STT → LLM →
//! validation → persistence → response. Input, context, exercise and STT
//! failures stop the run with a single status. Scoring and persistence
//! failures are collected into `errors` and the run still answers 200 with
//! whatever succeeded: a broken scoring backend never costs the transcript.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::{RunError, RunErrorKind, Stage};
use crate::logging::{TRANSCRIPT_PREVIEW_CHARS, truncate};
use crate::providers::{
    Capability, EvaluationInput, KeyValidation, LlmProvider, Provider, ProviderContext,
    ProviderFactory, SttProvider, Transcript, TranscriptionRequest,
};
use crate::rate_limit::RateLimiter;
use crate::repair::{HeuristicRepair, JsonRepair};
use crate::selector::select;
use crate::storage::{PracticeStore, UserSettings};
use crate::types::{
    AiMode, Attempt, AttemptId, EvaluationResult, Exercise, ModelInfo, ModelProviders,
    ProviderSelection, StageError, StageTimings, new_attempt_id,
};
use crate::validate::validate_evaluation;
use crate::vault::{self, CredentialRecord};

const MSG_INVALID_JSON: &str = "Invalid JSON body.";
const MSG_INVALID_PAYLOAD: &str = "Invalid practice payload.";
const MSG_AUDIO_TOO_SHORT: &str = "Audio is missing or too short to evaluate.";
const MSG_RATE_LIMITED: &str = "Too many practice requests.";
const MSG_SECRET_MISSING: &str = "OPENAI_KEY_ENCRYPTION_SECRET is not configured.";
const MSG_KEY_UNREADABLE: &str = "Stored API key could not be decrypted.";
const MSG_CLOUD_NEEDS_KEY: &str = "Cloud mode requires an API key. Add one in Settings to continue.";
const MSG_SETTINGS_UNAVAILABLE: &str = "Could not load your settings. Please try again.";
const MSG_EXERCISE_NOT_FOUND: &str = "Exercise not found.";
const MSG_EXERCISE_UNAVAILABLE: &str = "Could not load the exercise. Please try again.";
const MSG_TRANSCRIPTION_FAILED: &str = "Transcription failed. Please try again.";
const MSG_SCORING_FAILED: &str = "Scoring failed. Check your AI provider settings and try again.";
const MSG_INVALID_EVALUATION: &str = "We could not score this response due to invalid evaluation output.";
const MSG_SAVE_FAILED: &str = "We couldn't save this attempt. Please try again.";
const MSG_VALIDATE_RATE_LIMITED: &str = "Too many validation attempts. Try again shortly.";
const MSG_NO_KEY: &str = "No key provided and no key stored.";

/// Body of a run request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub exercise_id: String,
    #[serde(default)]
    pub attempt_id: Option<AttemptId>,
    /// Base64 audio, optionally as a `data:` URL
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub mode: Option<AiMode>,
}

/// The authenticated caller of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Include timings and chosen providers in the response
    pub debug: bool,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptOutcome {
    pub text: String,
    pub provider: ProviderSelection,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringOutcome {
    pub evaluation: EvaluationResult,
    pub provider: ProviderSelection,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugTimings {
    pub input_parse: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedProviders {
    pub stt: ProviderSelection,
    pub llm: Option<ProviderSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub timings: DebugTimings,
    pub selected_providers: SelectedProviders,
}

/// JSON body returned for every run, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<TranscriptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StageError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

impl RunResponse {
    fn failed(request_id: String, err: &RunError) -> Self {
        Self {
            request_id,
            attempt_id: None,
            transcript: None,
            scoring: None,
            errors: vec![StageError::new(err.stage, err.message.clone())],
            debug: None,
        }
    }
}

/// HTTP status plus body for one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReply {
    pub status: u16,
    pub body: RunResponse,
}

/// Mode, endpoints and key in effect for one run
struct RunContext {
    mode: AiMode,
    providers: ProviderContext,
}

fn millis(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Orchestrates runs against a store, provider factory and rate limiter
pub struct PracticeRunner {
    config: RuntimeConfig,
    store: Arc<dyn PracticeStore>,
    providers: Arc<dyn ProviderFactory>,
    limiter: RateLimiter,
    repair: Arc<dyn JsonRepair>,
}

impl PracticeRunner {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn PracticeStore>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Self {
        let limiter = RateLimiter::in_memory(config.rate_limit_max, config.rate_limit_window);
        Self {
            config,
            store,
            providers,
            limiter,
            repair: Arc::new(HeuristicRepair),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_repair(mut self, repair: Arc<dyn JsonRepair>) -> Self {
        self.repair = repair;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run the full pipeline for a raw JSON request body
    pub async fn run(&self, caller: &Caller, body: &str) -> RunReply {
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!("practice_run", request_id = %request_id, user_id = %caller.user_id);

        async {
            info!(event = "practice.run.start");
            match self.execute(&request_id, caller, body).await {
                Ok(response) => RunReply {
                    status: 200,
                    body: response,
                },
                Err(err) => {
                    warn!(
                        event = "practice.run.failed",
                        stage = err.stage.as_str(),
                        status = err.http_status(),
                        error = %err.message,
                    );
                    RunReply {
                        status: err.http_status(),
                        body: RunResponse::failed(request_id.clone(), &err),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, request_id: &str, caller: &Caller, body: &str) -> Result<RunResponse, RunError> {
        let debug_enabled = caller.debug || self.config.debug_enabled();
        let user_id = caller.user_id.as_str();

        // 1. input
        let input_start = Instant::now();
        let (request, audio) = self.parse_input(body)?;
        let input_parse_ms = millis(input_start);
        info!(
            event = "input.parse.ok",
            stage = "input",
            exercise_id = %request.exercise_id,
            has_attempt_id = request.attempt_id.is_some(),
            audio_length = audio.len(),
        );

        // 2. rate limit
        if !self.limiter.check(&format!("practice:{user_id}")) {
            warn!(event = "practice.run.rate_limited", stage = "input");
            return Err(RunError::new(RunErrorKind::RateLimited, Stage::Input, MSG_RATE_LIMITED));
        }

        // 3. context
        let context = self.resolve_context(user_id, request.mode)?;

        // 4. exercise
        let exercise = match self.store.get_exercise(&request.exercise_id) {
            Ok(Some(exercise)) => exercise,
            Ok(None) => {
                warn!(event = "exercise.load.error", stage = "input", exercise_id = %request.exercise_id);
                return Err(RunError::new(RunErrorKind::NotFound, Stage::Input, MSG_EXERCISE_NOT_FOUND));
            }
            Err(e) => {
                error!(event = "exercise.load.error", stage = "db", error = %e);
                return Err(
                    RunError::new(RunErrorKind::Storage, Stage::Db, MSG_EXERCISE_UNAVAILABLE).with_cause(e),
                );
            }
        };
        info!(event = "exercise.load.ok", exercise_id = %exercise.id);

        // 5. transcription
        let (transcript, stt_selection, stt_ms) = self.transcribe(&context, audio, debug_enabled).await?;

        let mut errors = Vec::new();
        let existing = self.resolve_attempt(user_id, request.attempt_id.as_deref());
        let attempt_id = existing
            .as_ref()
            .map(|a| a.id.clone())
            .unwrap_or_else(new_attempt_id);

        // 6-8. scoring, never fatal
        let llm_provider = self.select_llm(&context, &mut errors).await;
        let llm_selection = llm_provider.as_ref().map(|p| p.selection());
        let mut llm_ms = None;
        let mut evaluation = None;
        if let Some(provider) = &llm_provider {
            let llm_start = Instant::now();
            let outcome = self
                .score(provider.as_ref(), &exercise, &attempt_id, &transcript, &mut errors)
                .await;
            llm_ms = Some(millis(llm_start));
            evaluation = outcome;
        }

        // 9. persistence, never fatal
        let model_info = ModelInfo {
            provider: ModelProviders {
                stt: stt_selection.clone(),
                llm: llm_selection.clone(),
            },
            timing_ms: StageTimings {
                stt: stt_ms,
                llm: llm_ms,
                total: stt_ms + llm_ms.unwrap_or(0),
            },
        };
        let attempt = build_attempt(
            existing,
            &attempt_id,
            user_id,
            &exercise.id,
            &transcript,
            evaluation.as_ref(),
            &model_info,
        );
        if let Err(e) = self.persist(&attempt) {
            error!(event = "db.attempt.save.error", stage = "db", attempt_id = %attempt_id, error = %e);
            errors.push(StageError::new(Stage::Db, MSG_SAVE_FAILED));
        } else {
            info!(event = "db.attempt.save.ok", stage = "db", attempt_id = %attempt_id);
        }

        // 10. response
        if errors.is_empty() {
            info!(
                event = "practice.run.ok",
                attempt_id = %attempt_id,
                total_duration_ms = model_info.timing_ms.total,
            );
        } else {
            warn!(
                event = "practice.run.partial",
                attempt_id = %attempt_id,
                error_count = errors.len(),
            );
        }

        let debug = debug_enabled.then(|| DebugInfo {
            timings: DebugTimings {
                input_parse: input_parse_ms,
                stt: Some(stt_ms),
                llm: llm_ms,
            },
            selected_providers: SelectedProviders {
                stt: stt_selection.clone(),
                llm: llm_selection.clone(),
            },
        });

        let scoring = match (evaluation, llm_selection) {
            (Some(evaluation), Some(provider)) => Some(ScoringOutcome {
                evaluation,
                provider,
                duration_ms: llm_ms.unwrap_or(0),
            }),
            _ => None,
        };

        Ok(RunResponse {
            request_id: request_id.to_string(),
            attempt_id: Some(attempt_id),
            transcript: Some(TranscriptOutcome {
                text: transcript.text,
                provider: stt_selection,
                duration_ms: stt_ms,
            }),
            scoring,
            errors,
            debug,
        })
    }

    fn parse_input(&self, body: &str) -> Result<(RunRequest, String), RunError> {
        let value: Value = serde_json::from_str(body).map_err(|e| {
            warn!(event = "input.parse.error", stage = "input", error = %e);
            RunError::new(RunErrorKind::InvalidInput, Stage::Input, MSG_INVALID_JSON)
        })?;

        let request: RunRequest = serde_json::from_value(value).map_err(|e| {
            warn!(event = "input.parse.error", stage = "input", error = %e);
            RunError::new(RunErrorKind::InvalidInput, Stage::Input, MSG_INVALID_PAYLOAD)
        })?;

        let audio_length = request.audio.as_deref().map_or(0, str::len);
        match request.audio.clone() {
            Some(audio) if audio_length >= self.config.min_audio_length => Ok((request, audio)),
            _ => {
                warn!(
                    event = "input.parse.error",
                    stage = "input",
                    reason = "audio_too_small",
                    audio_length,
                );
                Err(RunError::new(RunErrorKind::InvalidInput, Stage::Input, MSG_AUDIO_TOO_SHORT))
            }
        }
    }

    /// Effective mode, endpoints and cloud key for this user
    fn resolve_context(&self, user_id: &str, requested: Option<AiMode>) -> Result<RunContext, RunError> {
        let settings = self
            .store
            .get_user_settings(user_id)
            .map_err(|e| {
                error!(event = "auth.context.error", stage = "db", error = %e);
                RunError::new(RunErrorKind::Storage, Stage::Db, MSG_SETTINGS_UNAVAILABLE).with_cause(e)
            })?
            .unwrap_or_else(|| UserSettings::new(user_id));

        let mode = settings.ai_mode.or(requested).unwrap_or(self.config.ai_mode);

        let api_key = match &settings.credential {
            Some(record) => Some(self.decrypt_stored(record)?),
            None => self.config.default_api_key.clone(),
        }
        .filter(|k| !k.is_empty());

        let providers = ProviderContext {
            local_stt_url: settings
                .local_stt_url
                .unwrap_or_else(|| self.config.local_stt_url.clone()),
            local_llm_url: settings
                .local_llm_url
                .unwrap_or_else(|| self.config.local_llm_url.clone()),
            api_key,
        };

        info!(
            event = "auth.context.ok",
            mode = mode.as_str(),
            has_api_key = providers.has_api_key(),
            stored_key = settings.credential.is_some(),
        );

        if mode == AiMode::CloudOnly && !providers.has_api_key() {
            warn!(event = "auth.context.error", reason = "api_key_missing", mode = mode.as_str());
            return Err(RunError::new(RunErrorKind::InvalidInput, Stage::Input, MSG_CLOUD_NEEDS_KEY));
        }

        Ok(RunContext { mode, providers })
    }

    fn decrypt_stored(&self, record: &CredentialRecord) -> Result<String, RunError> {
        let secret = self
            .config
            .encryption_secret
            .as_deref()
            .ok_or_else(|| RunError::new(RunErrorKind::Misconfigured, Stage::Input, MSG_SECRET_MISSING))?;

        vault::decrypt(secret, record).map_err(|e| {
            error!(event = "auth.context.error", reason = "decrypt_failed", key_version = %record.key_version);
            RunError::new(RunErrorKind::Misconfigured, Stage::Input, MSG_KEY_UNREADABLE).with_cause(e)
        })
    }

    async fn transcribe(
        &self,
        context: &RunContext,
        audio: String,
        debug_enabled: bool,
    ) -> Result<(Transcript, ProviderSelection, u64), RunError> {
        info!(event = "stt.select.start", stage = "stt", mode = context.mode.as_str());
        let selected = match self.providers.stt_providers(&context.providers) {
            Ok(pair) => select(Capability::Stt, context.mode, &pair).await,
            Err(e) => Err(e),
        }
        .map_err(|e| {
            error!(event = "stt.select.error", stage = "stt", error = %e);
            let message = e.to_string();
            RunError::new(RunErrorKind::ProviderUnavailable, Stage::Stt, message).with_cause(e)
        })?;

        let provider = selected.provider;
        let selection = provider.selection();
        info!(
            event = "stt.select.ok",
            stage = "stt",
            kind = selection.kind.as_str(),
            model = %selection.model,
            health = ?selected.health,
        );

        let start = Instant::now();
        let transcript = provider
            .transcribe(TranscriptionRequest::new(audio))
            .await
            .map_err(|e| {
                error!(
                    event = "stt.transcribe.error",
                    stage = "stt",
                    duration_ms = millis(start),
                    error = %e,
                );
                RunError::new(RunErrorKind::TranscriptionFailed, Stage::Stt, MSG_TRANSCRIPTION_FAILED)
                    .with_cause(e)
            })?;
        let duration = millis(start);

        info!(
            event = "stt.transcribe.ok",
            stage = "stt",
            duration_ms = duration,
            transcript_length = transcript.text.chars().count(),
        );
        if debug_enabled {
            debug!(
                event = "stt.transcribe.preview",
                transcript_preview = %truncate(&transcript.text, TRANSCRIPT_PREVIEW_CHARS),
            );
        }

        Ok((transcript, selection, duration))
    }

    /// An id the caller owns is reused; anything else gets a fresh attempt
    fn resolve_attempt(&self, user_id: &str, requested: Option<&str>) -> Option<Attempt> {
        let id = requested.filter(|id| !id.is_empty())?;
        match self.store.find_attempt(id, user_id) {
            Ok(Some(attempt)) => Some(attempt),
            Ok(None) => {
                warn!(event = "attempt.resolve.not_found", attempt_id = id);
                None
            }
            Err(e) => {
                error!(event = "attempt.resolve.error", stage = "db", attempt_id = id, error = %e);
                None
            }
        }
    }

    async fn select_llm(&self, context: &RunContext, errors: &mut Vec<StageError>) -> Option<Arc<dyn LlmProvider>> {
        info!(event = "llm.select.start", stage = "scoring", mode = context.mode.as_str());
        let selected = match self.providers.llm_providers(&context.providers) {
            Ok(pair) => select(Capability::Llm, context.mode, &pair).await,
            Err(e) => Err(e),
        };

        match selected {
            Ok(selected) => {
                info!(
                    event = "llm.select.ok",
                    stage = "scoring",
                    kind = selected.provider.kind().as_str(),
                    model = selected.provider.model(),
                    health = ?selected.health,
                );
                Some(selected.provider)
            }
            Err(e) => {
                error!(event = "llm.select.error", stage = "scoring", error = %e);
                errors.push(StageError::new(Stage::Scoring, e.to_string()));
                None
            }
        }
    }

    async fn score(
        &self,
        provider: &dyn LlmProvider,
        exercise: &Exercise,
        attempt_id: &str,
        transcript: &Transcript,
        errors: &mut Vec<StageError>,
    ) -> Option<EvaluationResult> {
        let start = Instant::now();
        info!(event = "llm.evaluate.start", stage = "scoring", attempt_id);

        let input = EvaluationInput {
            exercise: exercise.clone(),
            attempt_id: attempt_id.to_string(),
            transcript: transcript.clone(),
        };
        let raw = match provider.evaluate(&input).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    event = "llm.evaluate.error",
                    stage = "scoring",
                    duration_ms = millis(start),
                    error = %e,
                );
                errors.push(StageError::new(Stage::Scoring, MSG_SCORING_FAILED));
                return None;
            }
        };
        info!(event = "llm.evaluate.ok", stage = "scoring", duration_ms = millis(start));

        match validate_evaluation(&raw.text, exercise, self.repair.as_ref()) {
            Ok(result) => Some(result),
            Err(failure) => {
                warn!(
                    event = "llm.evaluate.invalid",
                    stage = "scoring",
                    attempt_id,
                    repaired = failure.repaired,
                    issues = %truncate(&failure.issues.join("; "), crate::logging::BODY_PREVIEW_CHARS),
                );
                errors.push(StageError::new(Stage::Scoring, MSG_INVALID_EVALUATION));
                None
            }
        }
    }

    /// Update the caller's row when it exists, insert otherwise
    fn persist(&self, attempt: &Attempt) -> crate::error::Result<()> {
        if self.store.update_attempt(attempt)? {
            return Ok(());
        }
        self.store.insert_attempt(attempt)
    }

    /// Check a supplied key, or the user's stored key when none is given
    pub async fn validate_key(&self, user_id: &str, provided: Option<&str>) -> Result<KeyValidation, RunError> {
        if !self.limiter.check(&format!("key-validate:{user_id}")) {
            warn!(user_id, "Key validation rate limited");
            return Err(RunError::new(RunErrorKind::RateLimited, Stage::Input, MSG_VALIDATE_RATE_LIMITED));
        }

        let key = match provided.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => key.to_string(),
            None => {
                let record = self
                    .store
                    .get_user_settings(user_id)
                    .map_err(|e| {
                        RunError::new(RunErrorKind::Storage, Stage::Db, MSG_SETTINGS_UNAVAILABLE).with_cause(e)
                    })?
                    .and_then(|s| s.credential)
                    .ok_or_else(|| RunError::new(RunErrorKind::InvalidInput, Stage::Input, MSG_NO_KEY))?;
                self.decrypt_stored(&record)?
            }
        };

        let result = self.providers.validate_key(&key).await;
        if result.ok {
            info!(user_id, "API key validated");
        } else {
            warn!(user_id, error = result.error.as_deref().unwrap_or(""), "API key validation failed");
        }
        Ok(result)
    }
}

fn build_attempt(
    existing: Option<Attempt>,
    attempt_id: &str,
    user_id: &str,
    exercise_id: &str,
    transcript: &Transcript,
    evaluation: Option<&EvaluationResult>,
    model_info: &ModelInfo,
) -> Attempt {
    let now = Utc::now();
    let mut attempt = existing.unwrap_or_else(|| Attempt {
        id: attempt_id.to_string(),
        user_id: user_id.to_string(),
        exercise_id: exercise_id.to_string(),
        started_at: now,
        completed_at: None,
        audio_ref: None,
        transcript: String::new(),
        evaluation: Value::Object(Default::default()),
        overall_score: 0.0,
        overall_pass: false,
        model_info: Value::Object(Default::default()),
    });

    attempt.completed_at = Some(now);
    attempt.transcript = transcript.text.clone();
    attempt.evaluation = evaluation
        .and_then(|e| serde_json::to_value(e).ok())
        .unwrap_or_else(|| Value::Object(Default::default()));
    attempt.overall_score = evaluation.map_or(0.0, |e| e.overall.score);
    attempt.overall_pass = evaluation.is_some_and(|e| e.overall.pass);
    attempt.model_info = serde_json::to_value(model_info).unwrap_or_else(|_| Value::Object(Default::default()));
    attempt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderKind;
    use serde_json::json;

    fn transcript() -> Transcript {
        Transcript::new("It sounds lonely.")
    }

    fn model_info() -> ModelInfo {
        ModelInfo {
            provider: ModelProviders {
                stt: ProviderSelection {
                    kind: ProviderKind::Local,
                    model: "whisper-large-v3".to_string(),
                },
                llm: None,
            },
            timing_ms: StageTimings {
                stt: 120,
                llm: None,
                total: 120,
            },
        }
    }

    #[test]
    fn test_run_request_accepts_legacy_mode() {
        let request: RunRequest = serde_json::from_value(json!({
            "exercise_id": "ex-1",
            "audio": "AAAA",
            "mode": "openai_only"
        }))
        .unwrap();
        assert_eq!(request.mode, Some(AiMode::CloudOnly));
        assert!(request.attempt_id.is_none());
    }

    #[test]
    fn test_run_request_rejects_unknown_mode() {
        let result: Result<RunRequest, _> = serde_json::from_value(json!({
            "exercise_id": "ex-1",
            "audio": "AAAA",
            "mode": "fastest"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_failed_response_shape() {
        let err = RunError::new(RunErrorKind::NotFound, Stage::Input, MSG_EXERCISE_NOT_FOUND);
        let body = serde_json::to_value(RunResponse::failed("req-1".to_string(), &err)).unwrap();
        assert_eq!(
            body,
            json!({
                "requestId": "req-1",
                "errors": [{ "stage": "input", "message": "Exercise not found." }]
            })
        );
    }

    #[test]
    fn test_new_attempt_without_evaluation_scores_zero() {
        let attempt = build_attempt(None, "a-1", "u1", "ex-1", &transcript(), None, &model_info());
        assert_eq!(attempt.id, "a-1");
        assert_eq!(attempt.overall_score, 0.0);
        assert!(!attempt.overall_pass);
        assert_eq!(attempt.evaluation, json!({}));
        assert!(attempt.completed_at.is_some());
        assert_eq!(attempt.model_info["provider"]["llm"], Value::Null);
        assert!(attempt.model_info["timing_ms"].get("llm").is_none());
    }

    #[test]
    fn test_existing_attempt_keeps_identity() {
        let mut existing = Attempt::start("u1", "ex-1");
        existing.audio_ref = Some("s3://bucket/a.webm".to_string());
        let started = existing.started_at;
        let id = existing.id.clone();

        let attempt = build_attempt(Some(existing), &id, "u1", "ex-1", &transcript(), None, &model_info());
        assert_eq!(attempt.started_at, started);
        assert_eq!(attempt.audio_ref.as_deref(), Some("s3://bucket/a.webm"));
        assert_eq!(attempt.transcript, "It sounds lonely.");
    }

    #[test]
    fn test_response_omits_empty_errors() {
        let response = RunResponse {
            request_id: "r".to_string(),
            attempt_id: Some("a".to_string()),
            transcript: None,
            scoring: None,
            errors: Vec::new(),
            debug: None,
        };
        let body = serde_json::to_value(response).unwrap();
        assert!(body.get("errors").is_none());
        assert_eq!(body["attemptId"], json!("a"));
    }
}
