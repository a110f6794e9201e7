//! Self-hosted backend speaking the local runtime's JSON protocol
//!
//! `GET {base}/health` (200 = healthy), `POST {base}/transcribe` with
//! `{audio}`, `POST {base}/evaluate` with the evaluation input.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::types::ProviderKind;

use super::{
    EvaluationInput, HttpTimeouts, LlmProvider, Provider, RawEvaluation, SttProvider,
    StructuredTask, Transcript, TranscriptionRequest, check_status,
};

async fn ping_health(client: &Client, base_url: &str, timeouts: HttpTimeouts) -> bool {
    match client
        .get(format!("{base_url}/health"))
        .timeout(timeouts.health)
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(base_url, error = %e, "Local health check failed");
            false
        }
    }
}

fn normalize_base(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

/// Local Whisper-style transcription service
pub struct LocalSttProvider {
    client: Client,
    base_url: String,
    model: String,
    timeouts: HttpTimeouts,
}

impl LocalSttProvider {
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: normalize_base(base_url),
            model: model.into(),
            timeouts: HttpTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[derive(Debug, Serialize)]
struct TranscribeBody<'a> {
    audio: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[async_trait]
impl Provider for LocalSttProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> bool {
        ping_health(&self.client, &self.base_url, self.timeouts).await
    }
}

#[async_trait]
impl SttProvider for LocalSttProvider {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcript> {
        debug!(base_url = %self.base_url, "Sending transcription request to local STT");

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .timeout(self.timeouts.request)
            .json(&TranscribeBody {
                audio: &request.audio_base64,
                language: request.language.as_deref(),
            })
            .send()
            .await?;

        let response = check_status(response).await.inspect_err(|e| {
            error!(error = %e, "Local STT error");
        })?;

        Ok(response.json::<Transcript>().await?)
    }
}

/// Local evaluation model served over HTTP
pub struct LocalLlmProvider {
    client: Client,
    base_url: String,
    model: String,
    timeouts: HttpTimeouts,
}

impl LocalLlmProvider {
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: normalize_base(base_url),
            model: model.into(),
            timeouts: HttpTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: HttpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[async_trait]
impl Provider for LocalLlmProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> bool {
        ping_health(&self.client, &self.base_url, self.timeouts).await
    }
}

#[async_trait]
impl LlmProvider for LocalLlmProvider {
    async fn evaluate(&self, input: &EvaluationInput) -> Result<RawEvaluation> {
        let start = Instant::now();
        info!(event = "llm.evaluate.http_start", kind = "local", model = %self.model);

        let response = self
            .client
            .post(format!("{}/evaluate", self.base_url))
            .timeout(self.timeouts.request)
            .json(input)
            .send()
            .await?;

        let response = match check_status(response).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    event = "llm.evaluate.http_error",
                    kind = "local",
                    duration_ms = start.elapsed().as_millis() as u64,
                    error = %e,
                );
                return Err(e);
            }
        };

        // the body stays text: it is untrusted until validated
        let text = response.text().await?;
        info!(
            event = "llm.evaluate.http_ok",
            kind = "local",
            duration_ms = start.elapsed().as_millis() as u64,
        );
        Ok(RawEvaluation::new(text))
    }

    async fn parse_source_text(&self, _text: &str) -> Result<StructuredTask> {
        Err(Error::Unsupported(
            "Local LLM does not support exercise parsing".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{recording_stub_server, split_request, stub_server};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_health_check_ok() {
        let base = stub_server(200, "{}", 1).await;
        let provider = LocalSttProvider::new(Client::new(), base, "whisper-large-v3");
        assert!(provider.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_non_2xx_is_unhealthy() {
        let base = stub_server(503, "{}", 1).await;
        let provider = LocalLlmProvider::new(Client::new(), base, "local-model");
        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn test_health_check_unreachable_is_unhealthy() {
        // bind then drop so the port is almost certainly closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = LocalSttProvider::new(Client::new(), format!("http://{addr}/"), "m");
        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn test_transcribe_parses_text() {
        let base = stub_server(200, r#"{"text":"I hear you","confidence":0.9,"extra":1}"#, 1).await;
        let provider = LocalSttProvider::new(Client::new(), base, "whisper-large-v3");
        let transcript = provider
            .transcribe(TranscriptionRequest::new("AAAA"))
            .await
            .unwrap();
        assert_eq!(transcript.text, "I hear you");
        assert_eq!(transcript.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn test_transcribe_posts_audio_json() {
        let (base, recorded) = recording_stub_server(200, r#"{"text":"ok"}"#, 1).await;
        let provider = LocalSttProvider::new(Client::new(), format!("{base}/"), "whisper-large-v3");
        provider
            .transcribe(TranscriptionRequest::new("QUJD"))
            .await
            .unwrap();

        let requests = recorded.lock();
        let (request_line, _, body) = split_request(&requests[0]);
        assert!(request_line.starts_with("POST /transcribe "));
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["audio"], "QUJD");
    }

    #[tokio::test]
    async fn test_transcribe_error_carries_status_and_truncated_body() {
        let long_body: &'static str = Box::leak("x".repeat(500).into_boxed_str());
        let base = stub_server(500, long_body, 1).await;
        let provider = LocalSttProvider::new(Client::new(), base, "whisper-large-v3");
        let err = provider
            .transcribe(TranscriptionRequest::new("AAAA"))
            .await
            .unwrap_err();
        match err {
            Error::Http { status, body } => {
                assert_eq!(status, 500);
                assert!(body.chars().count() <= 201);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_evaluate_returns_raw_text() {
        let base = stub_server(200, r#"{"version":"1.0","overall":"#, 1).await;
        let provider = LocalLlmProvider::new(Client::new(), base, "local-model");
        let input = EvaluationInput {
            exercise: serde_json::from_value(serde_json::json!({
                "id": "ex-1",
                "title": "t",
                "objectives": []
            }))
            .unwrap(),
            attempt_id: "a1".to_string(),
            transcript: Transcript::new("hello"),
        };
        let raw = provider.evaluate(&input).await.unwrap();
        assert_eq!(raw.text, r#"{"version":"1.0","overall":"#);
    }

    #[tokio::test]
    async fn test_local_llm_does_not_parse_source_text() {
        let provider = LocalLlmProvider::new(Client::new(), "http://localhost:7002", "m");
        assert!(matches!(
            provider.parse_source_text("text").await,
            Err(Error::Unsupported(_))
        ));
    }
}
