use std::sync::Arc;

use async_trait::async_trait;
use ptm_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const TEMPERATURE: f64 = 0.2;
const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub prompt: String,
    /// Ask the model for a JSON-only response.
    pub json_mode: bool,
    pub max_output_tokens: u32,
}

impl LlmRequest {
    pub fn json(prompt: impl Into<String>, max_output_tokens: u32) -> Self {
        Self {
            prompt: prompt.into(),
            json_mode: true,
            max_output_tokens,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Http(#[from] FetchError),
    #[error("llm returned no candidates")]
    EmptyResponse,
    #[error("llm response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("llm response has unexpected shape: {0}")]
    Malformed(String),
}

/// The structured-extraction / classification / scoring collaborator.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Raw text of the first candidate.
    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

/// Removes a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_blocks(raw: &str) -> &str {
    let text = raw.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => return "",
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

pub fn parse_json_response(raw: &str) -> Result<JsonValue, LlmError> {
    let body = strip_code_blocks(raw);
    if body.is_empty() {
        return Err(LlmError::Malformed("empty body".to_string()));
    }
    Ok(serde_json::from_str(body)?)
}

/// Generate, strip fences, parse.
pub async fn generate_json(client: &dyn LlmClient, request: &LlmRequest) -> Result<JsonValue, LlmError> {
    let raw = client.generate(request).await?;
    parse_json_response(&raw)
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Gemini `generateContent` over the shared fetcher. Rate limiting and
/// 429/5xx backoff come from the fetcher's configuration.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    /// The key travels in a header so it never shows up in logged or
    /// persisted URLs.
    fn url(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }

    fn body(request: &LlmRequest) -> JsonValue {
        let mut generation = json!({
            "temperature": TEMPERATURE,
            "maxOutputTokens": request.max_output_tokens,
        });
        if request.json_mode {
            generation["responseMimeType"] = json!("application/json");
        }
        json!({
            "contents": [{ "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation,
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let resp = self
            .http
            .post_json(
                "gemini",
                &self.url(),
                &[(API_KEY_HEADER, self.api_key.as_str())],
                &Self::body(request),
            )
            .await?;
        let parsed: GenerateResponse = serde_json::from_slice(&resp.body)?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .ok_or(LlmError::EmptyResponse)?;
        debug!(model = %self.model, chars = text.len(), "gemini response received");
        Ok(text)
    }
}
