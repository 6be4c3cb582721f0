//! Chatbot module - answers group messages with local arithmetic or Gemini.

pub mod calc;
pub mod commands;
pub mod engine;
pub mod format;
pub mod gemini;
pub mod groups;
pub mod history;
pub mod message;
pub mod pool;
pub mod scheduler;
pub mod telegram;
pub mod trigger;


pub use engine::{ChatbotConfig, ChatbotEngine};
pub use gemini::GeminiClient;
pub use message::ChatMessage;
pub use pool::PoolConfig;
pub use telegram::TelegramClient;
pub use trigger::{BotIdentity, TriggerConfig};
