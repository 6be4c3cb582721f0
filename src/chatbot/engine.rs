//! Chatbot engine - routes group messages to the calculator or the model pool.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use teloxide::utils::command::BotCommands;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chatbot::calc::{evaluate, format_number, looks_like_expression};
use crate::chatbot::commands::{ClearTarget, Command, parse_clear_target, parse_schedule_args};
use crate::chatbot::format::sanitize;
use crate::chatbot::gemini::ModelBackend;
use crate::chatbot::groups::GroupRegistry;
use crate::chatbot::history::ConversationStore;
use crate::chatbot::message::ChatMessage;
use crate::chatbot::pool::{FATAL_REPLY, ModelPool, PoolConfig, Reply};
use crate::chatbot::scheduler::{Scheduler, parse_fire_time};
use crate::chatbot::telegram::MessageSender;
use crate::chatbot::trigger::{BotIdentity, TriggerConfig, TriggerPolicy};

pub const THINKING_PLACEHOLDER: &str = "🤔 思考中…";
pub const EMPTY_PROMPT_HINT: &str = "💡 請在提及我之後輸入問題，例如：@我 今天天氣如何？";
pub const PRIVATE_CHAT_NOTICE: &str = "🙅 這個機器人只在群組中服務";
pub const APOLOGY: &str = "⚠️ 處理訊息時發生錯誤，請稍後再試";

/// Chatbot configuration.
#[derive(Debug, Clone)]
pub struct ChatbotConfig {
    pub bot: BotIdentity,
    /// Users allowed to run admin commands in private chat.
    pub admin_ids: HashSet<i64>,
    /// Longer payloads are rejected without calling the model.
    pub max_input_chars: usize,
    pub context_window: usize,
    pub timezone: Tz,
    pub trigger: TriggerConfig,
    pub pool: PoolConfig,
}

/// The chatbot engine.
pub struct ChatbotEngine<S, M> {
    config: ChatbotConfig,
    telegram: Arc<S>,
    history: Arc<ConversationStore>,
    pool: ModelPool<M>,
    trigger: TriggerPolicy,
    groups: GroupRegistry,
    scheduler: Scheduler<S>,
    ai_enabled: AtomicBool,
    /// Private users already told the bot is group-only.
    notified_private: Mutex<HashSet<i64>>,
    started_at: Instant,
}

impl<S: MessageSender, M: ModelBackend> ChatbotEngine<S, M> {
    pub fn new(config: ChatbotConfig, telegram: Arc<S>, backend: Arc<M>) -> Self {
        let history = Arc::new(ConversationStore::new(config.context_window));
        let pool = ModelPool::new(backend, config.pool.clone(), Arc::clone(&history));
        let trigger = TriggerPolicy::new(config.trigger.clone());
        let scheduler = Scheduler::new(Arc::clone(&telegram), config.timezone);

        Self {
            config,
            telegram,
            history,
            pool,
            trigger,
            groups: GroupRegistry::new(),
            scheduler,
            ai_enabled: AtomicBool::new(true),
            notified_private: Mutex::new(HashSet::new()),
            started_at: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn history(&self) -> &ConversationStore {
        &self.history
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai_enabled.load(Ordering::Relaxed)
    }

    /// Handle an incoming message. Failures are logged and answered with a
    /// generic apology; they never escape.
    pub async fn handle_message(&self, msg: ChatMessage) {
        info!("📨 {} ({}) in {}: \"{}\"", msg.username, msg.user_id, msg.chat_id, msg.preview());

        if let Err(e) = self.process(&msg).await {
            error!("Failed to handle message {} in chat {}: {}", msg.message_id, msg.chat_id, e);
            if let Err(e) = self.telegram.send_message(msg.chat_id, APOLOGY, Some(msg.message_id)).await {
                warn!("Failed to send apology: {}", e);
            }
        }
    }

    async fn process(&self, msg: &ChatMessage) -> Result<(), String> {
        if !msg.is_private {
            self.groups
                .observe(msg.chat_id, msg.chat_title.as_deref().unwrap_or_default())
                .await;
        }
        if msg.is_bot {
            return Ok(());
        }

        if msg.is_private {
            if self.config.admin_ids.contains(&msg.user_id) {
                if let Ok(command) = Command::parse(&msg.text, &self.config.bot.username) {
                    let reply = self.handle_command(command).await;
                    self.reply(msg, &reply).await?;
                    return Ok(());
                }
                if self.config.trigger.group_only {
                    self.reply(msg, "輸入 /help 查看管理指令").await?;
                    return Ok(());
                }
            } else if self.config.trigger.group_only {
                // Only tell each user once
                if self.notified_private.lock().await.insert(msg.user_id) {
                    self.reply(msg, PRIVATE_CHAT_NOTICE).await?;
                }
                return Ok(());
            }
        } else if self.is_clear_command(&msg.text) {
            let reply = if self.history.clear(msg.chat_id).await {
                "🧹 已清除這個群組的對話紀錄"
            } else {
                "🧹 目前沒有對話紀錄"
            };
            self.reply(msg, reply).await?;
            return Ok(());
        }

        let Some(triggered) = self.trigger.check(msg, &self.config.bot).await else {
            return Ok(());
        };
        let prompt = triggered.text;

        if prompt.is_empty() {
            self.reply(msg, EMPTY_PROMPT_HINT).await?;
            return Ok(());
        }
        if prompt.chars().count() > self.config.max_input_chars {
            let notice = format!("✂️ 訊息太長了（上限 {} 字）", self.config.max_input_chars);
            self.reply(msg, &notice).await?;
            return Ok(());
        }

        if looks_like_expression(&prompt) {
            let answer = match evaluate(&prompt) {
                Ok(value) => format!("🧮 結果：{}", format_number(value)),
                Err(e) => format!("⚠️ 計算錯誤：{}", e),
            };
            self.reply(msg, &answer).await?;
            return Ok(());
        }

        if !self.ai_enabled() {
            debug!("AI disabled, ignoring message {} in chat {}", msg.message_id, msg.chat_id);
            return Ok(());
        }

        let placeholder = match self.reply(msg, THINKING_PLACEHOLDER).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to send placeholder: {}", e);
                None
            }
        };

        let answer = match self.pool.get_response(msg.chat_id, &prompt).await {
            Reply::Answer { text, .. } => {
                let cleaned = sanitize(&text);
                if cleaned.is_empty() { FATAL_REPLY.to_string() } else { cleaned }
            }
            other => other.text().to_string(),
        };
        let sent = self.reply(msg, &answer).await;

        if let Some(id) = placeholder
            && let Err(e) = self.telegram.delete_message(msg.chat_id, id).await
        {
            warn!("Failed to delete placeholder: {}", e);
        }

        sent.map(|_| ())
    }

    async fn reply(&self, msg: &ChatMessage, text: &str) -> Result<i64, String> {
        self.telegram
            .send_message(msg.chat_id, text, Some(msg.message_id))
            .await
    }

    /// `/clear` or `/clear@<bot>` with no arguments, as typed in a group.
    fn is_clear_command(&self, text: &str) -> bool {
        let mut words = text.split_whitespace();
        let Some(first) = words.next() else {
            return false;
        };
        if words.next().is_some() {
            return false;
        }
        let first = first.to_lowercase();
        first == "/clear" || first == format!("/clear@{}", self.config.bot.username.to_lowercase())
    }

    async fn handle_command(&self, command: Command) -> String {
        info!("🛠️ Admin command: {:?}", command);
        match command {
            Command::Help => Command::descriptions().to_string(),
            Command::Groups => self.groups_report().await,
            Command::Schedules => self.schedules_report().await,
            Command::Schedule(args) => match self.schedule(&args).await {
                Ok(reply) | Err(reply) => reply,
            },
            Command::Cancel(id) => {
                if self.scheduler.cancel(id).await {
                    format!("✅ 已取消排程 #{}", id)
                } else {
                    format!("❌ 找不到排程 #{}", id)
                }
            }
            Command::AiOn => {
                self.ai_enabled.store(true, Ordering::Relaxed);
                info!("🟢 AI replies enabled");
                "🟢 AI 回覆已開啟".to_string()
            }
            Command::AiOff => {
                self.ai_enabled.store(false, Ordering::Relaxed);
                info!("🔴 AI replies disabled");
                "🔴 AI 回覆已關閉（計算仍會回應）".to_string()
            }
            Command::Clear(args) => match self.clear(&args).await {
                Ok(reply) | Err(reply) => reply,
            },
            Command::Status => self.status_report().await,
        }
    }

    async fn groups_report(&self) -> String {
        let groups = self.groups.list().await;
        if groups.is_empty() {
            return "目前還沒有看過任何群組".to_string();
        }
        let mut out = String::from("已知群組：\n");
        for group in groups {
            let _ = writeln!(out, "#{} {} ({})", group.number, group.title, group.chat_id);
        }
        out
    }

    async fn schedules_report(&self) -> String {
        let tasks = self.scheduler.list().await;
        if tasks.is_empty() {
            return "目前沒有排程".to_string();
        }
        let mut out = String::from("排程訊息：\n");
        for (position, task) in tasks.iter().enumerate() {
            let group = match self.groups.get(task.chat_id).await {
                Some(g) => format!("#{} {}", g.number, g.title),
                None => task.chat_id.to_string(),
            };
            let _ = writeln!(
                out,
                "{}. [id {}] {} · {}\n   {}",
                position + 1,
                task.id,
                group,
                self.scheduler.local_time(task.fire_at),
                task.text
            );
        }
        out
    }

    async fn schedule(&self, args: &str) -> Result<String, String> {
        let args = parse_schedule_args(args)?;
        let group = self
            .groups
            .chat_for_number(args.group)
            .await
            .ok_or_else(|| format!("❌ 找不到群組 #{}，用 /groups 查看", args.group))?;
        let fire_at = parse_fire_time(&args.when, self.config.timezone, Utc::now())
            .map_err(|e| format!("❌ {}", e))?;
        let id = self
            .scheduler
            .schedule(group.chat_id, &args.text, fire_at)
            .await
            .map_err(|e| format!("❌ {}", e))?;

        Ok(format!(
            "✅ 已排程 id {}：{} 發送到 #{} {}",
            id,
            self.scheduler.local_time(fire_at),
            group.number,
            group.title
        ))
    }

    async fn clear(&self, args: &str) -> Result<String, String> {
        match parse_clear_target(args)? {
            ClearTarget::All => {
                let count = self.history.clear_all().await;
                Ok(format!("🧹 已清除 {} 個對話紀錄", count))
            }
            ClearTarget::Group(number) => {
                let group = self
                    .groups
                    .chat_for_number(number)
                    .await
                    .ok_or_else(|| format!("❌ 找不到群組 #{}", number))?;
                self.history.clear(group.chat_id).await;
                Ok(format!("🧹 已清除 #{} {} 的對話紀錄", group.number, group.title))
            }
        }
    }

    async fn status_report(&self) -> String {
        let mut out = String::from("📊 狀態\n");
        let _ = writeln!(out, "運行時間：{}", format_uptime(self.started_at.elapsed()));
        let _ = writeln!(out, "AI 回覆：{}", if self.ai_enabled() { "開啟" } else { "關閉" });
        let _ = writeln!(out, "群組數：{}", self.groups.len().await);
        let _ = writeln!(out, "對話紀錄：{} 個", self.history.chat_count().await);
        let _ = writeln!(out, "排程：{} 個", self.scheduler.len().await);
        let _ = writeln!(
            out,
            "模型：{}{}",
            self.pool.models().join(" → "),
            if self.config.pool.rotate { "（輪替）" } else { "" }
        );
        let _ = write!(out, "時區：{}", self.config.timezone);
        out
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (days, hours, minutes) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60);
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}
