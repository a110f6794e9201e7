//! Evaluation (LLM) provider trait and types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;
use crate::types::{Exercise, GradingRules, Objective};

use super::Provider;
use super::transcription::Transcript;

/// Everything the scoring backend needs to grade one response
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationInput {
    pub exercise: Exercise,
    pub attempt_id: String,
    pub transcript: Transcript,
}

/// Untrusted evaluation text exactly as the backend produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvaluation {
    pub text: String,
}

impl RawEvaluation {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Exercise structure extracted from free-form source text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredTask {
    pub title: String,
    pub description: String,
    pub skill_domain: String,
    pub difficulty: u8,
    pub example_prompt: String,
    pub objectives: Vec<Objective>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl StructuredTask {
    /// Turn the extracted task into an unpublished exercise
    pub fn into_exercise(self, id: impl Into<String>) -> Exercise {
        let slug = slugify(&self.title);
        Exercise {
            id: id.into(),
            slug,
            title: self.title,
            description: self.description,
            skill_domain: self.skill_domain,
            difficulty: self.difficulty.clamp(1, 5),
            patient_profile: Value::Object(Default::default()),
            example_prompt: self.example_prompt,
            example_good_response: None,
            objectives: self.objectives,
            grading: GradingRules::default(),
            tags: self.tags,
            is_published: false,
        }
    }

    /// JSON Schema sent to the structured-output endpoint
    pub fn schema() -> Value {
        let anchor = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["score", "meaning"],
            "properties": {
                "score": { "type": "integer", "minimum": 0, "maximum": 4 },
                "meaning": { "type": "string" }
            }
        });
        let rubric = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["score_min", "score_max", "anchors"],
            "properties": {
                "score_min": { "type": "integer", "const": 0 },
                "score_max": { "type": "integer", "const": 4 },
                "anchors": { "type": "array", "items": anchor }
            }
        });
        let objective = json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["id", "label", "description", "rubric"],
            "properties": {
                "id": { "type": "string" },
                "label": { "type": "string" },
                "description": { "type": "string" },
                "rubric": rubric
            }
        });
        json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["title", "description", "skill_domain", "difficulty", "example_prompt", "objectives", "tags"],
            "properties": {
                "title": { "type": "string" },
                "description": { "type": "string" },
                "skill_domain": { "type": "string" },
                "difficulty": { "type": "integer", "minimum": 1, "maximum": 5 },
                "example_prompt": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "objectives": { "type": "array", "minItems": 1, "items": objective }
            }
        })
    }
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Trait for evaluation providers
#[async_trait]
pub trait LlmProvider: Provider {
    /// Grade a transcript against the exercise rubric
    async fn evaluate(&self, input: &EvaluationInput) -> Result<RawEvaluation>;

    /// Extract a structured exercise from free-form text
    async fn parse_source_text(&self, text: &str) -> Result<StructuredTask>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Reflecting Feelings: Part 1!"), "reflecting-feelings-part-1");
        assert_eq!(slugify("  --Already-- slugged  "), "already-slugged");
    }

    #[test]
    fn test_into_exercise_clamps_difficulty() {
        let task = StructuredTask {
            title: "Validation".to_string(),
            description: "Validate the client's feelings".to_string(),
            skill_domain: "empathy".to_string(),
            difficulty: 9,
            example_prompt: "I feel stuck.".to_string(),
            objectives: vec![],
            tags: vec![],
        };
        let exercise = task.into_exercise("ex-9");
        assert_eq!(exercise.id, "ex-9");
        assert_eq!(exercise.slug, "validation");
        assert_eq!(exercise.difficulty, 5);
        assert!(!exercise.is_published);
    }

    #[test]
    fn test_task_schema_accepts_extracted_task() {
        let schema = jsonschema::JSONSchema::compile(&StructuredTask::schema()).unwrap();
        let task = serde_json::json!({
            "title": "Validation",
            "description": "Validate the client's feelings",
            "skill_domain": "empathy",
            "difficulty": 2,
            "example_prompt": "I feel stuck.",
            "tags": ["empathy"],
            "objectives": [{
                "id": "o1",
                "label": "Name the feeling",
                "description": "Reflect the feeling back",
                "rubric": {
                    "score_min": 0,
                    "score_max": 4,
                    "anchors": [{ "score": 0, "meaning": "Ignores it" }, { "score": 4, "meaning": "Names it" }]
                }
            }]
        });
        assert!(schema.is_valid(&task));

        let mut bad_anchor = task.clone();
        bad_anchor["objectives"][0]["rubric"]["anchors"][0]["score"] = serde_json::json!(7);
        assert!(!schema.is_valid(&bad_anchor));

        let mut no_objectives = task;
        no_objectives["objectives"] = serde_json::json!([]);
        assert!(!schema.is_valid(&no_objectives));
    }
}
