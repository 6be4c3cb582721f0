//! Gemini API client for text generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::chatbot::history::{Role, Turn};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Error from a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Transport failure (connect, TLS, timeout).
    Http { message: String, timeout: bool },
    /// Non-success HTTP status with the error message from the body.
    Status { status: u16, body: String },
    /// Response body could not be decoded.
    Parse(String),
    /// Blocked by the safety filter.
    Blocked(String),
    /// No text in the response.
    Empty,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { message, timeout: true } => write!(f, "HTTP timeout: {message}"),
            Self::Http { message, .. } => write!(f, "HTTP error: {message}"),
            Self::Status { status, body } => write!(f, "API error {status}: {body}"),
            Self::Parse(e) => write!(f, "Parse error: {e}"),
            Self::Blocked(reason) => write!(f, "Blocked: {reason}"),
            Self::Empty => write!(f, "Empty response"),
        }
    }
}

impl std::error::Error for ApiError {}

/// How the fallback chain should react to an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rate limit or quota exhausted: try the next model.
    Quota,
    /// Upstream overloaded or down: try the next model.
    Unavailable,
    /// Anything else: give up.
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Quota | Self::Unavailable)
    }
}

const QUOTA_MARKERS: &[&str] = &["quota", "resource_exhausted", "rate limit"];
const UNAVAILABLE_MARKERS: &[&str] = &["unavailable", "overloaded"];

/// The one place that decides whether an error is worth another model.
///
/// | error                                   | kind          |
/// |-----------------------------------------|---------------|
/// | status 429, or body mentions quota      | `Quota`       |
/// | status 500/502/503/504, or overloaded   | `Unavailable` |
/// | transport timeout                       | `Unavailable` |
/// | anything else                           | `Fatal`       |
pub fn classify(err: &ApiError) -> ErrorKind {
    match err {
        ApiError::Status { status, body } => {
            let body = body.to_lowercase();
            if *status == 429 || QUOTA_MARKERS.iter().any(|m| body.contains(m)) {
                ErrorKind::Quota
            } else if matches!(status, 500 | 502 | 503 | 504)
                || UNAVAILABLE_MARKERS.iter().any(|m| body.contains(m))
            {
                ErrorKind::Unavailable
            } else {
                ErrorKind::Fatal
            }
        }
        ApiError::Http { timeout: true, .. } => ErrorKind::Unavailable,
        ApiError::Http { message, .. } => {
            if QUOTA_MARKERS.iter().any(|m| message.to_lowercase().contains(m)) {
                ErrorKind::Quota
            } else {
                ErrorKind::Fatal
            }
        }
        ApiError::Parse(_) | ApiError::Blocked(_) | ApiError::Empty => ErrorKind::Fatal,
    }
}

/// Something that can turn a conversation into a reply with a given model.
pub trait ModelBackend: Send + Sync + 'static {
    fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        contents: &[Turn],
    ) -> impl Future<Output = Result<String, ApiError>> + Send;
}

pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: Role,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
struct PromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize, Debug)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl GeminiClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;

        Ok(Self { api_key, client })
    }

    async fn generate_content(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        contents: &[Turn],
    ) -> Result<String, ApiError> {
        let request = GenerateRequest {
            contents: contents
                .iter()
                .map(|turn| Content {
                    role: turn.role,
                    parts: vec![Part { text: &turn.content }],
                })
                .collect(),
            system_instruction: system_prompt.map(|text| SystemInstruction {
                parts: vec![Part { text }],
            }),
        };

        let url = format!("{GEMINI_API_BASE}/{model}:generateContent");

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::Http {
                message: e.to_string(),
                timeout: e.is_timeout(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ApiError::Http {
            message: format!("Failed to read response: {e}"),
            timeout: e.is_timeout(),
        })?;

        debug!("Gemini {model} response status: {status}");

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: error_message(&body),
            });
        }

        parse_response(&body)
    }
}

impl ModelBackend for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        system_prompt: Option<&str>,
        contents: &[Turn],
    ) -> Result<String, ApiError> {
        self.generate_content(model, system_prompt, contents).await
    }
}

/// Pull `error.message` (and `error.status`) out of an error body, falling
/// back to the raw body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => match envelope.error.status {
            Some(status) => format!("{status}: {}", envelope.error.message),
            None => envelope.error.message,
        },
        Err(_) => body.chars().take(500).collect(),
    }
}

fn parse_response(body: &str) -> Result<String, ApiError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| ApiError::Parse(e.to_string()))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ApiError::Blocked(reason));
    }

    let candidate = parsed
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or(ApiError::Empty)?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_default();
        return match reason.as_str() {
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => Err(ApiError::Blocked(reason)),
            _ => Err(ApiError::Empty),
        };
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, body: &str) -> ApiError {
        ApiError::Status { status, body: body.to_string() }
    }

    #[test]
    fn test_classify_table() {
        let cases = [
            (status(429, "Too Many Requests"), ErrorKind::Quota),
            (status(403, "Quota exceeded for metric"), ErrorKind::Quota),
            (status(400, "RESOURCE_EXHAUSTED: try later"), ErrorKind::Quota),
            (status(500, "internal"), ErrorKind::Unavailable),
            (status(502, ""), ErrorKind::Unavailable),
            (status(503, "The model is overloaded"), ErrorKind::Unavailable),
            (status(504, "deadline"), ErrorKind::Unavailable),
            (status(400, "UNAVAILABLE"), ErrorKind::Unavailable),
            (status(400, "Invalid argument"), ErrorKind::Fatal),
            (status(401, "API key not valid"), ErrorKind::Fatal),
            (status(404, "models/foo is not found"), ErrorKind::Fatal),
            (ApiError::Http { message: "timed out".into(), timeout: true }, ErrorKind::Unavailable),
            (ApiError::Http { message: "connection refused".into(), timeout: false }, ErrorKind::Fatal),
            (ApiError::Parse("eof".into()), ErrorKind::Fatal),
            (ApiError::Blocked("SAFETY".into()), ErrorKind::Fatal),
            (ApiError::Empty, ErrorKind::Fatal),
        ];
        for (err, expected) in cases {
            assert_eq!(classify(&err), expected, "{err}");
        }
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Quota.is_retryable());
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn test_request_serialization() {
        let turns = vec![Turn::user("hi"), Turn::model("hello"), Turn::user("2+2?")];
        let request = GenerateRequest {
            contents: turns
                .iter()
                .map(|t| Content { role: t.role, parts: vec![Part { text: &t.content }] })
                .collect(),
            system_instruction: Some(SystemInstruction { parts: vec![Part { text: "be brief" }] }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][2]["parts"][0]["text"], "2+2?");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "be brief");
    }

    #[test]
    fn test_parse_response_joins_parts() {
        let body = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello "},{"text":"world"}]},"finishReason":"STOP"}]}"#;
        assert_eq!(parse_response(body).unwrap(), "Hello world");
    }

    #[test]
    fn test_parse_response_blocked() {
        let body = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert_eq!(parse_response(body), Err(ApiError::Blocked("SAFETY".into())));

        let body = r#"{"candidates":[{"finishReason":"SAFETY"}]}"#;
        assert_eq!(parse_response(body), Err(ApiError::Blocked("SAFETY".into())));
    }

    #[test]
    fn test_parse_response_empty() {
        assert_eq!(parse_response(r#"{"candidates":[]}"#), Err(ApiError::Empty));
        assert!(matches!(parse_response("not json"), Err(ApiError::Parse(_))));
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"code":429,"message":"You exceeded your current quota","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(error_message(body), "RESOURCE_EXHAUSTED: You exceeded your current quota");
        assert_eq!(error_message("plain text"), "plain text");
    }
}
