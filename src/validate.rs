//! Strict validation of untrusted evaluation output
//!
//! Raw LLM text is checked against the evaluation JSON Schema, deserialized
//! into [`EvaluationResult`], and cross-checked against the exercise's
//! objectives. On failure one repair pass is attempted and the same checks run
//! again. Nothing is coerced: a wrong type stays wrong.

use std::sync::LazyLock;

use jsonschema::JSONSchema;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::repair::JsonRepair;
use crate::types::{EVALUATION_VERSION, EvaluationResult, Exercise};

static EVALUATION_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "required": [
            "version", "exercise_id", "attempt_id", "transcript",
            "objective_scores", "overall"
        ],
        "properties": {
            "version": { "type": "string", "const": EVALUATION_VERSION },
            "exercise_id": { "type": "string" },
            "attempt_id": { "type": "string" },
            "transcript": {
                "type": "object",
                "required": ["text"],
                "properties": {
                    "text": { "type": "string" },
                    "confidence": { "type": "number" },
                    "words": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["w"],
                            "properties": {
                                "w": { "type": "string" },
                                "t0": { "type": "number" },
                                "t1": { "type": "number" },
                                "p": { "type": "number" }
                            }
                        }
                    }
                }
            },
            "objective_scores": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["objective_id", "score", "rationale_short"],
                    "properties": {
                        "objective_id": { "type": "string" },
                        "score": { "type": "number", "minimum": 0, "maximum": 4 },
                        "rationale_short": { "type": "string", "maxLength": 240 },
                        "evidence_quotes": { "type": "array", "items": { "type": "string" } },
                        "missed_points": { "type": "array", "items": { "type": "string" } }
                    }
                }
            },
            "overall": {
                "type": "object",
                "required": ["score", "pass", "summary_feedback", "what_to_improve_next"],
                "properties": {
                    "score": { "type": "number", "minimum": 0, "maximum": 4 },
                    "pass": { "type": "boolean" },
                    "summary_feedback": { "type": "string", "maxLength": 400 },
                    "what_to_improve_next": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1,
                        "maxItems": 3
                    }
                }
            },
            "patient_reaction": {
                "type": "object",
                "required": ["emotion", "intensity"],
                "properties": {
                    "emotion": {
                        "type": "string",
                        "enum": ["neutral", "warm", "sad", "anxious", "angry", "relieved", "engaged"]
                    },
                    "intensity": { "type": "integer", "enum": [0, 1, 2, 3] },
                    "action": {
                        "type": "string",
                        "enum": ["nod", "shake_head", "look_away", "lean_in", "sigh", "smile"]
                    },
                    "response_text": { "type": "string" }
                }
            }
        }
    })
});

// Compiled once; the schema is a constant so a compile error is a bug
static COMPILED_SCHEMA: LazyLock<std::result::Result<JSONSchema, String>> =
    LazyLock::new(|| JSONSchema::compile(&EVALUATION_SCHEMA).map_err(|e| e.to_string()));

/// JSON Schema for [`EvaluationResult`], shared with schema-guided completion
pub fn evaluation_schema() -> &'static Value {
    &EVALUATION_SCHEMA
}

fn compiled_schema() -> Result<&'static JSONSchema> {
    COMPILED_SCHEMA
        .as_ref()
        .map_err(|e| Error::Config(format!("Evaluation schema does not compile: {e}")))
}

/// Evaluation output that stayed invalid after the repair pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid evaluation output: {}", issues.join("; "))]
pub struct ValidationFailure {
    pub issues: Vec<String>,
    /// Whether repair produced parseable JSON that still failed the checks
    pub repaired: bool,
}

/// Validate raw evaluation text, repairing syntax at most once
pub fn validate_evaluation(
    raw: &str,
    exercise: &Exercise,
    repair: &dyn JsonRepair,
) -> std::result::Result<EvaluationResult, ValidationFailure> {
    let first_issues = match serde_json::from_str::<Value>(raw) {
        Ok(value) => match check_value(&value, exercise) {
            Ok(result) => return Ok(result),
            Err(issues) => issues,
        },
        Err(e) => vec![format!("not valid JSON: {e}")],
    };
    debug!(issues = first_issues.len(), "Evaluation failed validation, attempting repair");

    let repaired = match repair.repair(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Evaluation repair failed");
            let mut issues = first_issues;
            issues.push(e.to_string());
            return Err(ValidationFailure {
                issues,
                repaired: false,
            });
        }
    };

    check_value(&repaired, exercise).map_err(|issues| {
        warn!(issues = %issues.join("; "), "Repaired evaluation still invalid");
        ValidationFailure {
            issues,
            repaired: true,
        }
    })
}

/// Schema check, typed decode, and objective cross-check
fn check_value(value: &Value, exercise: &Exercise) -> std::result::Result<EvaluationResult, Vec<String>> {
    let schema = compiled_schema().map_err(|e| vec![e.to_string()])?;

    if let Err(errors) = schema.validate(value) {
        let issues: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        return Err(issues);
    }

    let result: EvaluationResult =
        serde_json::from_value(value.clone()).map_err(|e| vec![format!("decode: {e}")])?;

    let unknown: Vec<String> = result
        .objective_scores
        .iter()
        .filter(|s| !exercise.has_objective(&s.objective_id))
        .map(|s| format!("unknown objective id: {}", s.objective_id))
        .collect();
    if !unknown.is_empty() {
        return Err(unknown);
    }

    Ok(result)
}
