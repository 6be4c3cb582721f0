//! Model fallback chain.
//!
//! Tries each configured model at most once per request. Quota and
//! availability errors move on to the next model; any other error ends the
//! request immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::chatbot::gemini::{ModelBackend, classify};
use crate::chatbot::history::{ConversationStore, Turn};

/// Reply when a model fails with a non-retryable error.
pub const FATAL_REPLY: &str = "⚠️ AI 發生錯誤";

/// Reply when every model in the pool is busy.
pub const BUSY_REPLY: &str = "🚫 AI 目前忙線中，請稍後再試";

/// How the fallback chain behaves.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Model ids in preference order.
    pub models: Vec<String>,
    /// Start the next request after the last model that succeeded.
    pub rotate: bool,
    /// Pause before moving to the next model.
    pub backoff: Duration,
    pub system_prompt: Option<String>,
}

/// Outcome of one request through the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer { model: String, text: String },
    Failed,
    Busy,
}

impl Reply {
    /// The text to show the user.
    pub fn text(&self) -> &str {
        match self {
            Self::Answer { text, .. } => text,
            Self::Failed => FATAL_REPLY,
            Self::Busy => BUSY_REPLY,
        }
    }
}

pub struct ModelPool<M> {
    backend: Arc<M>,
    config: PoolConfig,
    history: Arc<ConversationStore>,
    cursor: AtomicUsize,
}

impl<M: ModelBackend> ModelPool<M> {
    pub fn new(backend: Arc<M>, config: PoolConfig, history: Arc<ConversationStore>) -> Self {
        Self {
            backend,
            config,
            history,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn models(&self) -> &[String] {
        &self.config.models
    }

    #[cfg(test)]
    pub fn history(&self) -> &ConversationStore {
        &self.history
    }

    /// Answer `prompt` in the context of the chat's history.
    ///
    /// The user turn and the reply are only committed to history on success.
    pub async fn get_response(&self, chat_id: i64, prompt: &str) -> Reply {
        let pool_size = self.config.models.len();
        if pool_size == 0 {
            return Reply::Busy;
        }

        let mut contents = self.history.snapshot(chat_id).await;
        contents.push(Turn::user(prompt));

        let start = if self.config.rotate {
            self.cursor.load(Ordering::Relaxed) % pool_size
        } else {
            0
        };

        for attempt in 0..pool_size {
            let index = (start + attempt) % pool_size;
            let model = &self.config.models[index];

            if attempt > 0 && !self.config.backoff.is_zero() {
                tokio::time::sleep(self.config.backoff).await;
            }

            match self
                .backend
                .generate(model, self.config.system_prompt.as_deref(), &contents)
                .await
            {
                Ok(text) => {
                    let text = text.trim().to_string();
                    info!("🤖 {} answered chat {} ({} chars)", model, chat_id, text.len());
                    self.history
                        .append(chat_id, [Turn::user(prompt), Turn::model(text.clone())])
                        .await;
                    if self.config.rotate {
                        self.cursor.store((index + 1) % pool_size, Ordering::Relaxed);
                    }
                    return Reply::Answer { model: model.clone(), text };
                }
                Err(e) => {
                    let kind = classify(&e);
                    if kind.is_retryable() {
                        warn!("⏭️ {} unavailable ({:?}): {}", model, kind, e);
                        continue;
                    }
                    warn!("❌ {} failed: {}", model, e);
                    return Reply::Failed;
                }
            }
        }

        warn!("🚫 All {} model(s) busy for chat {}", pool_size, chat_id);
        Reply::Busy
    }
}
