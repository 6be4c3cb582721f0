//! Webhook HTTP surface built on axum.
//!
//! Routes:
//! - `POST <webhook_path>`: Telegram updates
//! - `GET /`: liveness text
//! - `GET /health`: JSON status

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use teloxide::types::{Update, UpdateKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chatbot::gemini::ModelBackend;
use crate::chatbot::telegram::MessageSender;
use crate::chatbot::{ChatMessage, ChatbotEngine};

/// Header Telegram uses to echo the webhook secret.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

pub struct AppState<S, M> {
    pub engine: Arc<ChatbotEngine<S, M>>,
    /// Expected value of the secret header; `None` disables the check.
    pub secret: Option<String>,
    pub started_at: Instant,
}

impl<S, M> Clone for AppState<S, M> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            secret: self.secret.clone(),
            started_at: self.started_at,
        }
    }
}

pub fn router<S: MessageSender, M: ModelBackend>(webhook_path: &str, state: AppState<S, M>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health::<S, M>))
        .route(webhook_path, post(webhook::<S, M>))
        .with_state(state)
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn serve(addr: &str, app: Router, shutdown: CancellationToken) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {addr}: {e}"))?;

    info!("🌐 Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("Server error: {e}"))
}

async fn index() -> &'static str {
    "Bot running"
}

async fn health<S: MessageSender, M: ModelBackend>(State(state): State<AppState<S, M>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "ai_enabled": state.engine.ai_enabled(),
        "groups": state.engine.groups().len().await,
        "scheduled": state.engine.scheduler().len().await,
    }))
}

async fn webhook<S: MessageSender, M: ModelBackend>(
    State(state): State<AppState<S, M>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json(&headers) {
        warn!("Rejected webhook call without JSON content type");
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Some(expected) = &state.secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("Rejected webhook call with wrong secret token");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Undecodable update: {e}");
            return (StatusCode::BAD_REQUEST, "bad update").into_response();
        }
    };

    match update.kind {
        UpdateKind::Message(msg) => {
            if let Some(chat_msg) = ChatMessage::from_telegram(&msg) {
                let engine = Arc::clone(&state.engine);
                // Answer Telegram right away; the model call can take seconds
                tokio::spawn(async move {
                    engine.handle_message(chat_msg).await;
                });
            }
        }
        _ => debug!("Ignoring non-message update {}", update.id.0),
    }

    "ok".into_response()
}

/// `application/json`, parameters such as `charset` allowed.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}
