//! Inbound message model, decoupled from teloxide's types.

use teloxide::types::Message;

/// A text message received from Telegram.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub message_id: i64,
    /// Chat ID where this message was sent (negative = group, positive = DM).
    pub chat_id: i64,
    pub is_private: bool,
    /// Group title; `None` for private chats.
    pub chat_title: Option<String>,
    pub user_id: i64,
    pub username: String,
    pub is_bot: bool,
    pub text: String,
    /// Author of the message this one replies to.
    pub reply_to_user_id: Option<i64>,
}

/// Max chars shown when logging message text.
const PREVIEW_CHARS: usize = 50;

impl ChatMessage {
    /// Convert a Telegram message. Returns `None` for messages without text
    /// or caption.
    pub fn from_telegram(msg: &Message) -> Option<Self> {
        let text = msg.text().or_else(|| msg.caption())?.to_string();

        let user = msg.from.as_ref();
        let user_id = user.map(|u| u.id.0 as i64).unwrap_or(0);
        let username = user
            .and_then(|u| u.username.as_deref())
            .unwrap_or_else(|| user.map(|u| u.first_name.as_str()).unwrap_or("unknown"))
            .to_string();

        let reply_to_user_id = msg
            .reply_to_message()
            .and_then(|reply| reply.from.as_ref())
            .map(|u| u.id.0 as i64);

        Some(Self {
            message_id: msg.id.0 as i64,
            chat_id: msg.chat.id.0,
            is_private: msg.chat.is_private(),
            chat_title: msg.chat.title().map(str::to_string),
            user_id,
            username,
            is_bot: user.is_some_and(|u| u.is_bot),
            text,
            reply_to_user_id,
        })
    }

    /// Short single-line preview for logs.
    pub fn preview(&self) -> String {
        let flat = self.text.replace('\n', " ");
        let cut = truncate_safe(&flat, PREVIEW_CHARS);
        if cut.len() < flat.len() {
            format!("{cut}…")
        } else {
            cut.to_string()
        }
    }
}

/// Safely truncate a string at a char boundary.
fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
