//! Telegram client using teloxide.

use std::fmt::Display;
use std::future::Future;

use teloxide::prelude::*;
use teloxide::types::{MessageId, ParseMode, ReplyParameters};
use tracing::{info, warn};

use crate::chatbot::format::{MAX_MESSAGE_LEN, split_message, strip_markup};

/// Outbound message primitives the engine and scheduler need.
pub trait MessageSender: Send + Sync + 'static {
    /// Send text, optionally as a reply. Returns the id of the first message sent.
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> impl Future<Output = Result<i64, String>> + Send;

    fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> impl Future<Output = Result<(), String>> + Send;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    async fn send_chunk(
        &self,
        chat_id: i64,
        text: String,
        reply_to_message_id: Option<i64>,
        parse_mode: Option<ParseMode>,
    ) -> Result<i64, teloxide::RequestError> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);
        if let Some(mode) = parse_mode {
            request = request.parse_mode(mode);
        }
        if let Some(msg_id) = reply_to_message_id {
            let reply_params = ReplyParameters::new(MessageId(msg_id as i32));
            request = request.reply_parameters(reply_params);
        }
        request.await.map(|msg| msg.id.0 as i64)
    }
}

/// Markdown first; if Telegram rejects the entities, resend as plain text.
async fn send_with_fallback<F, Fut, E>(chat_id: i64, text: &str, mut send: F) -> Result<i64, String>
where
    F: FnMut(String, Option<ParseMode>) -> Fut,
    Fut: Future<Output = Result<i64, E>>,
    E: Display,
{
    match send(text.to_string(), Some(ParseMode::Markdown)).await {
        Ok(id) => Ok(id),
        Err(e) => {
            warn!("Markdown send failed in chat {}, retrying as plain text: {e}", chat_id);
            send(strip_markup(text), None).await.map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })
        }
    }
}

impl MessageSender for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        let mut first_id = None;
        for (i, chunk) in split_message(text, MAX_MESSAGE_LEN).iter().enumerate() {
            // Only the first chunk is threaded as a reply
            let reply_to = if i == 0 { reply_to_message_id } else { None };
            let id = send_with_fallback(chat_id, chunk, |text, mode| {
                self.send_chunk(chat_id, text, reply_to, mode)
            })
            .await?;
            first_id.get_or_insert(id);
        }
        first_id.ok_or_else(|| "Nothing to send".to_string())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<(), String> {
        info!("🗑️ Deleting message {} in chat {}", message_id, chat_id);

        self.bot
            .delete_message(ChatId(chat_id), MessageId(message_id as i32))
            .await
            .map_err(|e| {
                let msg = format!("Failed to delete message: {e}");
                warn!("{}", msg);
                msg
            })?;

        Ok(())
    }
}
