//! OpenAI provider implementations for Whisper transcription and schema-guided evaluation
//!
//! Health for the cloud path is "a non-empty key is configured". No network
//! round-trip is made, so `local_prefer` never pays for a cloud probe.

use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::logging::{BODY_PREVIEW_CHARS, truncate};
use crate::repair::{HeuristicRepair, JsonRepair};
use crate::types::ProviderKind;
use crate::validate::evaluation_schema;

use super::{
    EvaluationInput, HttpTimeouts, LlmProvider, Provider, RawEvaluation, SttProvider,
    StructuredTask, Transcript, TranscriptionRequest, check_status,
};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

const EVALUATION_INSTRUCTIONS: &str = "You are an evaluator for psychotherapy deliberate practice. \
    Score the therapist's transcribed response against each objective's rubric (0-4). \
    Only use objective ids that appear in the exercise. Keep rationales short. \
    Return strict JSON only that matches EvaluationResult.";

const PARSE_INSTRUCTIONS: &str = "You are a meticulous content-to-JSON extractor for a \
    deliberate-practice platform. Transform the provided free text into a single JSON object \
    that matches the schema. Preserve meaning and do not invent facts. Every gradable item \
    must become an objective with ids \"o1\", \"o2\", ... and a rubric with score_min 0, \
    score_max 4, and anchors for at least 0, 2 and 4 describing observable behavior. \
    Return strict JSON only.";

/// OpenAI Whisper transcription provider
pub struct OpenAiSttProvider {
    client: Client,
    has_key: bool,
    model: String,
    base_url: String,
    timeouts: HttpTimeouts,
}

impl OpenAiSttProvider {
    /// `client` must already carry the bearer credential when `has_key` is true
    pub fn new(client: Client, has_key: bool) -> Self {
        Self {
            client,
            has_key,
            model: "whisper-1".to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            timeouts: HttpTimeouts::default(),
        }
    }

    /// Set the model to use
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn require_key(&self) -> Result<()> {
        if self.has_key {
            Ok(())
        } else {
            Err(Error::ProviderNotConfigured("OpenAI API key not set".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

/// Decode caller audio, tolerating a `data:<mime>;base64,` prefix
fn decode_audio(audio: &str) -> Result<Vec<u8>> {
    let payload = match audio.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => audio,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| Error::Transcription(format!("Audio is not valid base64: {e}")))
}

#[async_trait]
impl Provider for OpenAiSttProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> bool {
        self.has_key
    }
}

#[async_trait]
impl SttProvider for OpenAiSttProvider {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript> {
        self.require_key()?;
        let audio = decode_audio(&request.audio_base64)?;

        let file_part = reqwest::multipart::Part::bytes(audio)
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .map_err(|e| Error::Transcription(format!("Failed to create form part: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "json");

        if let Some(lang) = &request.language {
            form = form.text("language", lang.clone());
        }

        debug!("Sending transcription request to OpenAI Whisper");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .timeout(self.timeouts.request)
            .multipart(form)
            .send()
            .await?;

        let response = check_status(response).await.inspect_err(|e| {
            error!(error = %e, "Whisper API error");
        })?;

        let whisper: WhisperResponse = response.json().await?;
        Ok(Transcript {
            text: whisper.text,
            confidence: None,
            language: whisper.language,
            words: None,
        })
    }
}

/// OpenAI structured-output evaluation provider
pub struct OpenAiLlmProvider {
    client: Client,
    has_key: bool,
    model: String,
    base_url: String,
    timeouts: HttpTimeouts,
}

impl OpenAiLlmProvider {
    /// `client` must already carry the bearer credential when `has_key` is true
    pub fn new(client: Client, has_key: bool) -> Self {
        Self {
            client,
            has_key,
            model: "gpt-4o-mini".to_string(),
            base_url: OPENAI_API_BASE.to_string(),
            timeouts: HttpTimeouts::default(),
        }
    }

    /// Set the model to use
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn require_key(&self) -> Result<()> {
        if self.has_key {
            Ok(())
        } else {
            Err(Error::ProviderNotConfigured("OpenAI API key not set".to_string()))
        }
    }

    /// Run one schema-guided completion and return the message text
    async fn structured_completion(
        &self,
        instructions: &str,
        input: String,
        schema_name: &str,
        schema: Value,
    ) -> Result<String> {
        self.require_key()?;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: instructions.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: input,
                },
            ],
            temperature: 0.2,
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: schema_name.to_string(),
                    schema,
                    strict: false,
                },
            },
        };

        let start = Instant::now();
        info!(event = "llm.http_start", kind = "cloud", model = %self.model, schema = schema_name);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeouts.request)
            .json(&request)
            .send()
            .await?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    event = "llm.http_error",
                    kind = "cloud",
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %truncate(&e.to_string(), BODY_PREVIEW_CHARS),
                );
                return Err(e);
            }
        };

        let chat: ChatResponse = response.json().await?;
        info!(
            event = "llm.http_ok",
            kind = "cloud",
            duration_ms = start.elapsed().as_millis() as u64,
            response_id = chat.id.as_deref().unwrap_or(""),
        );

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Evaluation("No completion returned".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: Value,
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Provider for OpenAiLlmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> bool {
        self.has_key
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn evaluate(&self, input: &EvaluationInput) -> Result<RawEvaluation> {
        let payload = serde_json::to_string(input)?;
        let text = self
            .structured_completion(
                EVALUATION_INSTRUCTIONS,
                payload,
                "EvaluationResult",
                evaluation_schema().clone(),
            )
            .await?;
        Ok(RawEvaluation::new(text))
    }

    async fn parse_source_text(&self, text: &str) -> Result<StructuredTask> {
        let raw = self
            .structured_completion(
                PARSE_INSTRUCTIONS,
                text.to_string(),
                "DeliberatePracticeTask",
                StructuredTask::schema(),
            )
            .await?;
        parse_lenient(&raw)
    }
}

/// Strict parse first, then one syntactic repair pass
fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, "Structured output did not parse, attempting repair");
            let repaired = HeuristicRepair.repair(raw)?;
            Ok(serde_json::from_value(repaired)?)
        }
    }
}

/// Outcome of checking a vendor key against the models endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyValidation {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KeyValidation {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Check a key with a cheap authenticated `GET /models`
///
/// `client` must carry the bearer credential being validated.
pub async fn validate_api_key(client: &Client, base_url: &str, timeouts: HttpTimeouts) -> KeyValidation {
    let response = client
        .get(format!("{}/models", base_url.trim_end_matches('/')))
        .timeout(timeouts.health.max(std::time::Duration::from_secs(10)))
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => KeyValidation {
            ok: true,
            error: None,
        },
        Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
            KeyValidation::failed("OpenAI rejected this key (401).")
        }
        Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
            KeyValidation::failed("OpenAI rate-limited this key (429).")
        }
        Ok(resp) => KeyValidation::failed(format!(
            "OpenAI validation failed ({}).",
            resp.status().as_u16()
        )),
        Err(e) => {
            warn!(error = %e, "OpenAI validation network error");
            KeyValidation::failed("Unable to reach OpenAI for validation.")
        }
    }
}
