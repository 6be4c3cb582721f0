//! Per-chat conversation memory.
//!
//! Each chat keeps at most `window` turns; the oldest fall off the front.
//! Nothing is persisted, history is gone after a restart.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::info;

/// Who said a turn. Serializes to the role names the Gemini API expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One message exchanged in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self { role: Role::Model, content: content.into() }
    }
}

/// Bounded history for every chat.
pub struct ConversationStore {
    window: usize,
    chats: Mutex<HashMap<i64, VecDeque<Turn>>>,
}

impl ConversationStore {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            chats: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Copy of a chat's history, oldest first.
    pub async fn snapshot(&self, chat_id: i64) -> Vec<Turn> {
        let chats = self.chats.lock().await;
        chats
            .get(&chat_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append turns and trim to the window.
    ///
    /// Stored history always opens with a user turn, so a model turn left at
    /// the front by trimming is dropped as well.
    pub async fn append(&self, chat_id: i64, turns: impl IntoIterator<Item = Turn>) {
        let mut chats = self.chats.lock().await;
        let history = chats.entry(chat_id).or_default();
        history.extend(turns);
        while history.len() > self.window {
            history.pop_front();
        }
        while history.front().is_some_and(|turn| turn.role == Role::Model) {
            history.pop_front();
        }
    }

    /// Forget one chat. Returns whether there was anything to forget.
    pub async fn clear(&self, chat_id: i64) -> bool {
        let removed = self.chats.lock().await.remove(&chat_id).is_some();
        if removed {
            info!("🧹 Cleared history for chat {}", chat_id);
        }
        removed
    }

    /// Forget every chat. Returns how many were cleared.
    pub async fn clear_all(&self) -> usize {
        let mut chats = self.chats.lock().await;
        let count = chats.len();
        chats.clear();
        info!("🧹 Cleared history for {} chat(s)", count);
        count
    }

    #[cfg(test)]
    pub async fn len(&self, chat_id: i64) -> usize {
        self.chats.lock().await.get(&chat_id).map_or(0, VecDeque::len)
    }

    /// Number of chats with history.
    pub async fn chat_count(&self) -> usize {
        self.chats.lock().await.len()
    }
}
