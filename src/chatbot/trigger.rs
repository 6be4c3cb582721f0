//! Decides whether an inbound message deserves a reply.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::chatbot::message::ChatMessage;

/// The bot's own identity, from `getMe`.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub user_id: i64,
    /// Username without the leading `@`.
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Ignore private chats entirely.
    pub group_only: bool,
    pub cooldown: Duration,
    /// e.g. `/ai`; matched at the start of the message.
    pub command_prefixes: Vec<String>,
    /// Matched anywhere in the message, case-insensitive.
    pub keywords: Vec<String>,
}

/// Why a message was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Reply,
    Mention,
    Prefix,
    Keyword,
}

/// An accepted message and the payload left after stripping the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Triggered {
    pub kind: TriggerKind,
    pub text: String,
}

pub struct TriggerPolicy {
    config: TriggerConfig,
    last_trigger: Mutex<HashMap<i64, Instant>>,
}

impl TriggerPolicy {
    pub fn new(config: TriggerConfig) -> Self {
        Self {
            config,
            last_trigger: Mutex::new(HashMap::new()),
        }
    }

    /// Decide for one message and start the chat's cooldown on acceptance.
    pub async fn check(&self, msg: &ChatMessage, bot: &BotIdentity) -> Option<Triggered> {
        let now = Instant::now();
        let mut last_trigger = self.last_trigger.lock().await;
        let triggered = self.evaluate(msg, bot, last_trigger.get(&msg.chat_id).copied(), now)?;
        last_trigger.insert(msg.chat_id, now);
        debug!("Triggered in chat {} by {:?}", msg.chat_id, triggered.kind);
        Some(triggered)
    }

    /// Pure decision, in order: private-chat filter, cooldown, reply to the
    /// bot, mention, command prefix, keyword.
    pub fn evaluate(
        &self,
        msg: &ChatMessage,
        bot: &BotIdentity,
        last_trigger: Option<Instant>,
        now: Instant,
    ) -> Option<Triggered> {
        if msg.is_bot {
            return None;
        }
        if msg.is_private && self.config.group_only {
            return None;
        }
        if let Some(last) = last_trigger
            && now.saturating_duration_since(last) < self.config.cooldown
        {
            return None;
        }

        let text = msg.text.trim();

        if msg.reply_to_user_id == Some(bot.user_id) {
            return Some(Triggered {
                kind: TriggerKind::Reply,
                text: strip_mentions(text, &bot.username),
            });
        }

        if mentions(text, &bot.username) {
            let stripped = strip_mentions(text, &bot.username);
            let text = match self.strip_command(&stripped, bot) {
                Some(rest) => rest.to_string(),
                None => stripped.clone(),
            };
            return Some(Triggered { kind: TriggerKind::Mention, text });
        }

        if let Some(rest) = self.strip_command(text, bot) {
            return Some(Triggered {
                kind: TriggerKind::Prefix,
                text: rest.to_string(),
            });
        }

        let lowered = text.to_lowercase();
        if self
            .config
            .keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
        {
            return Some(Triggered {
                kind: TriggerKind::Keyword,
                text: text.to_string(),
            });
        }

        None
    }

    /// Payload after a configured command prefix, if the text starts with one.
    fn strip_command<'a>(&self, text: &'a str, bot: &BotIdentity) -> Option<&'a str> {
        for prefix in &self.config.command_prefixes {
            if let Some(rest) = strip_prefix_ignore_case(text, prefix) {
                // "/ai@bot question" is the same command as "/ai question"
                let rest = strip_prefix_ignore_case(rest, &format!("@{}", bot.username)).unwrap_or(rest);
                // "/air" is not "/ai"
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return Some(rest.trim());
                }
            }
        }
        None
    }
}

fn handle(username: &str) -> String {
    format!("@{}", username.to_lowercase())
}

fn mentions(text: &str, username: &str) -> bool {
    !username.is_empty() && text.to_lowercase().contains(&handle(username))
}

/// Remove every `@username` mention, case-insensitively.
fn strip_mentions(text: &str, username: &str) -> String {
    if username.is_empty() {
        return text.trim().to_string();
    }
    let needle = handle(username);
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    // ASCII usernames keep byte offsets identical between `rest` and its lowercase.
    while let Some(pos) = find_ignore_ascii_case(rest, &needle) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + needle.len()..];
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() || text.len() < prefix.len() || !text.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, tail) = text.split_at(prefix.len());
    head.eq_ignore_ascii_case(prefix).then_some(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bot() -> BotIdentity {
        BotIdentity { user_id: 999, username: "mind_bot".to_string() }
    }

    fn policy(cooldown_secs: u64) -> TriggerPolicy {
        TriggerPolicy::new(TriggerConfig {
            group_only: true,
            cooldown: Duration::from_secs(cooldown_secs),
            command_prefixes: vec!["/ai".to_string(), "!ask".to_string()],
            keywords: vec!["Gemini".to_string()],
        })
    }

    fn group_msg(text: &str) -> ChatMessage {
        ChatMessage {
            message_id: 1,
            chat_id: -100,
            is_private: false,
            chat_title: Some("Group".to_string()),
            user_id: 7,
            username: "alice".to_string(),
            is_bot: false,
            text: text.to_string(),
            reply_to_user_id: None,
        }
    }

    fn eval(policy: &TriggerPolicy, msg: &ChatMessage) -> Option<Triggered> {
        policy.evaluate(msg, &bot(), None, Instant::now())
    }

    #[test]
    fn test_plain_message_is_ignored() {
        assert_eq!(eval(&policy(0), &group_msg("just chatting about lunch")), None);
    }

    #[test]
    fn test_private_chat_rejected_when_group_only() {
        let mut msg = group_msg("@mind_bot hello");
        msg.is_private = true;
        assert_eq!(eval(&policy(0), &msg), None);

        let open = TriggerPolicy::new(TriggerConfig {
            group_only: false,
            ..policy(0).config.clone()
        });
        assert!(eval(&open, &msg).is_some());
    }

    #[test]
    fn test_reply_to_bot() {
        let mut msg = group_msg("why?");
        msg.reply_to_user_id = Some(999);
        let triggered = eval(&policy(0), &msg).unwrap();
        assert_eq!(triggered.kind, TriggerKind::Reply);
        assert_eq!(triggered.text, "why?");
    }

    #[test]
    fn test_reply_to_someone_else_is_ignored() {
        let mut msg = group_msg("why?");
        msg.reply_to_user_id = Some(8);
        assert_eq!(eval(&policy(0), &msg), None);
    }

    #[test]
    fn test_mention_is_stripped() {
        let triggered = eval(&policy(0), &group_msg("hey @Mind_Bot what is rust?")).unwrap();
        assert_eq!(triggered.kind, TriggerKind::Mention);
        assert_eq!(triggered.text, "hey what is rust?");
    }

    #[test]
    fn test_prefix_is_stripped() {
        let triggered = eval(&policy(0), &group_msg("/ai tell me a joke")).unwrap();
        assert_eq!(triggered.kind, TriggerKind::Prefix);
        assert_eq!(triggered.text, "tell me a joke");

        let triggered = eval(&policy(0), &group_msg("/ai@mind_bot 2+2")).unwrap();
        assert_eq!(triggered.text, "2+2");

        let triggered = eval(&policy(0), &group_msg("!ASK why")).unwrap();
        assert_eq!(triggered.text, "why");
    }

    #[test]
    fn test_prefix_requires_word_boundary() {
        assert_eq!(eval(&policy(0), &group_msg("/air conditioner broke")), None);
    }

    #[test]
    fn test_keyword() {
        let triggered = eval(&policy(0), &group_msg("is gemini any good?")).unwrap();
        assert_eq!(triggered.kind, TriggerKind::Keyword);
        assert_eq!(triggered.text, "is gemini any good?");
    }

    #[test]
    fn test_bots_never_trigger() {
        let mut msg = group_msg("@mind_bot hi");
        msg.is_bot = true;
        assert_eq!(eval(&policy(0), &msg), None);
    }

    #[test]
    fn test_cooldown_window() {
        let policy = policy(10);
        let msg = group_msg("@mind_bot hi");
        let now = Instant::now();
        let last = now - Duration::from_secs(3);
        assert_eq!(policy.evaluate(&msg, &bot(), Some(last), now), None);

        let later = last + Duration::from_secs(11);
        assert!(policy.evaluate(&msg, &bot(), Some(last), later).is_some());
    }

    #[tokio::test]
    async fn test_check_updates_cooldown_only_on_accept() {
        let policy = policy(60);

        assert!(policy.check(&group_msg("nothing here"), &bot()).await.is_none());
        assert!(policy.last_trigger.lock().await.is_empty());

        assert!(policy.check(&group_msg("@mind_bot hi"), &bot()).await.is_some());
        assert!(policy.check(&group_msg("@mind_bot again"), &bot()).await.is_none());

        // Other chats have their own cooldown
        let mut other = group_msg("@mind_bot hi");
        other.chat_id = -200;
        assert!(policy.check(&other, &bot()).await.is_some());
    }

    #[test]
    fn test_strip_mentions_non_ascii_text() {
        assert_eq!(strip_mentions("你好 @mind_bot 今天天氣", "mind_bot"), "你好 今天天氣");
    }
}
