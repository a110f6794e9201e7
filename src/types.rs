//! Core types used throughout the practice pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Stage;

/// Opaque identifier for attempts
pub type AttemptId = String;

/// Generate a fresh attempt identifier
pub fn new_attempt_id() -> AttemptId {
    Uuid::new_v4().to_string()
}

/// Provider routing policy between the local service and the cloud vendor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    LocalOnly,
    #[serde(alias = "openai_only")]
    CloudOnly,
    #[default]
    LocalPrefer,
}

impl AiMode {
    /// Parse a mode name, accepting the legacy `openai_only` spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "local_only" => Some(AiMode::LocalOnly),
            "cloud_only" | "openai_only" => Some(AiMode::CloudOnly),
            "local_prefer" => Some(AiMode::LocalPrefer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AiMode::LocalOnly => "local_only",
            AiMode::CloudOnly => "cloud_only",
            AiMode::LocalPrefer => "local_prefer",
        }
    }
}

impl std::fmt::Display for AiMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backend family served a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Cloud,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Cloud => "cloud",
        }
    }
}

/// The provider chosen for a single call, recorded for auditability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub kind: ProviderKind,
    pub model: String,
}

/// A stage-tagged, non-fatal error reported alongside partial results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// Providers and timings recorded on an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: ModelProviders,
    pub timing_ms: StageTimings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProviders {
    pub stt: ProviderSelection,
    pub llm: Option<ProviderSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub stt: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<u64>,
    pub total: u64,
}

/// One graded (or partially graded) practice submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub user_id: String,
    pub exercise_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub audio_ref: Option<String>,
    pub transcript: String,
    /// Structured evaluation, or an empty object when none was recorded
    pub evaluation: Value,
    pub overall_score: f64,
    pub overall_pass: bool,
    /// Empty object until the pipeline records providers and timings
    pub model_info: Value,
}

impl Attempt {
    /// Empty shell created by the explicit start action
    pub fn start(user_id: impl Into<String>, exercise_id: impl Into<String>) -> Self {
        Self {
            id: new_attempt_id(),
            user_id: user_id.into(),
            exercise_id: exercise_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            audio_ref: None,
            transcript: String::new(),
            evaluation: Value::Object(Default::default()),
            overall_score: 0.0,
            overall_pass: false,
            model_info: Value::Object(Default::default()),
        }
    }
}

/// Condensed view returned when listing attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub id: AttemptId,
    pub exercise_id: String,
    pub overall_score: f64,
    pub overall_pass: bool,
    pub completed_at: DateTime<Utc>,
}

// ========== Exercises ==========

/// A practice exercise with its grading rubric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skill_domain: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
    #[serde(default)]
    pub patient_profile: Value,
    #[serde(default)]
    pub example_prompt: String,
    #[serde(default)]
    pub example_good_response: Option<String>,
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub grading: GradingRules,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_published: bool,
}

fn default_difficulty() -> u8 {
    3
}

impl Exercise {
    pub fn has_objective(&self, id: &str) -> bool {
        self.objectives.iter().any(|o| o.id == id)
    }
}

/// One gradable behavioral criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default)]
    pub rubric: Rubric,
}

/// The 0–4 scale with textual anchors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub score_min: u8,
    pub score_max: u8,
    pub anchors: Vec<RubricAnchor>,
}

impl Default for Rubric {
    fn default() -> Self {
        Self {
            score_min: 0,
            score_max: 4,
            anchors: vec![
                RubricAnchor::new(0, "Missed the target behavior."),
                RubricAnchor::new(2, "Partially demonstrated the behavior."),
                RubricAnchor::new(4, "Clearly demonstrated the behavior."),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricAnchor {
    pub score: u8,
    pub meaning: String,
}

impl RubricAnchor {
    pub fn new(score: u8, meaning: impl Into<String>) -> Self {
        Self {
            score,
            meaning: meaning.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingRules {
    #[serde(default)]
    pub pass_rule: PassRule,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_min_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_per_objective: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_objective_ids: Option<Vec<String>>,
}

// ========== Evaluation ==========

pub const EVALUATION_VERSION: &str = "1.0";

/// Rubric-based evaluation returned by the scoring backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub version: String,
    pub exercise_id: String,
    pub attempt_id: String,
    pub transcript: EvaluatedTranscript,
    pub objective_scores: Vec<ObjectiveScore>,
    pub overall: OverallScore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_reaction: Option<PatientReaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedTranscript {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveScore {
    pub objective_id: String,
    pub score: f64,
    pub rationale_short: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quotes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missed_points: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallScore {
    pub score: f64,
    pub pass: bool,
    pub summary_feedback: String,
    pub what_to_improve_next: Vec<String>,
}

/// Reaction signal consumed by the practice UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientReaction {
    pub emotion: Emotion,
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ReactionAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Neutral,
    Warm,
    Sad,
    Anxious,
    Angry,
    Relieved,
    Engaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Nod,
    ShakeHead,
    LookAway,
    LeanIn,
    Sigh,
    Smile,
}
