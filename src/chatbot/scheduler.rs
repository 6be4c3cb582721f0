//! One-shot scheduled messages to groups.
//!
//! Every task owns a Tokio timer. The task table and the timers are kept in
//! sync under one lock: a timer removes its own record before sending, so a
//! task fires at most once and never after it was cancelled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chatbot::telegram::MessageSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    /// Stable id, used by `/cancel`.
    pub id: u64,
    pub chat_id: i64,
    pub fire_at: DateTime<Utc>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    InPast,
    EmptyText,
    InvalidTime(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InPast => write!(f, "時間已經過去了"),
            Self::EmptyText => write!(f, "訊息內容不能是空的"),
            Self::InvalidTime(reason) => write!(f, "時間格式錯誤：{}", reason),
        }
    }
}

impl std::error::Error for ScheduleError {}

struct Entry {
    task: ScheduledTask,
    cancel: CancellationToken,
}

type TaskTable = Arc<Mutex<BTreeMap<u64, Entry>>>;

pub struct Scheduler<S> {
    sender: Arc<S>,
    timezone: Tz,
    tasks: TaskTable,
    next_id: AtomicU64,
}

impl<S: MessageSender> Scheduler<S> {
    pub fn new(sender: Arc<S>, timezone: Tz) -> Self {
        Self {
            sender,
            timezone,
            tasks: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Render an instant in the configured timezone.
    pub fn local_time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone).format("%Y-%m-%d %H:%M").to_string()
    }

    /// Record a task and start its timer. Returns the task's id.
    pub async fn schedule(
        &self,
        chat_id: i64,
        text: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<u64, ScheduleError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ScheduleError::EmptyText);
        }
        let now = Utc::now();
        let delay = (fire_at - now).to_std().map_err(|_| ScheduleError::InPast)?;
        if delay.is_zero() {
            return Err(ScheduleError::InPast);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = ScheduledTask {
            id,
            chat_id,
            fire_at,
            text: text.to_string(),
            created_at: now,
        };
        let cancel = CancellationToken::new();

        let mut tasks = self.tasks.lock().await;
        tasks.insert(id, Entry { task, cancel: cancel.clone() });

        let table = Arc::clone(&self.tasks);
        let sender = Arc::clone(&self.sender);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Timer for task #{} stopped", id);
                }
                _ = tokio::time::sleep(delay) => {
                    fire(&table, sender.as_ref(), id).await;
                }
            }
        });
        drop(tasks);

        info!("⏰ Scheduled task #{} for chat {} at {}", id, chat_id, self.local_time(fire_at));
        Ok(id)
    }

    /// Cancel a pending task. False if the id is unknown or already fired.
    pub async fn cancel(&self, id: u64) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.remove(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!("🛑 Cancelled task #{}", id);
                true
            }
            None => false,
        }
    }

    /// Pending tasks in creation order.
    pub async fn list(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().await.values().map(|e| e.task.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

async fn fire<S: MessageSender>(table: &Mutex<BTreeMap<u64, Entry>>, sender: &S, id: u64) {
    // Cancelled between the timer firing and taking the lock
    let Some(entry) = table.lock().await.remove(&id) else {
        return;
    };
    let task = entry.task;
    match sender.send_message(task.chat_id, &task.text, None).await {
        Ok(_) => info!("📨 Delivered task #{} to chat {}", id, task.chat_id),
        Err(e) => warn!("Failed to deliver task #{} to chat {}: {}", id, task.chat_id, e),
    }
}

/// Parse a fire time: `+30m`, `+2h`, `+1d`, `+1w`, `HH:MM` (next occurrence)
/// or `YYYY-MM-DD HH:MM`, the last two in `tz`.
pub fn parse_fire_time(input: &str, tz: Tz, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    let input = input.trim();

    if let Some(rest) = input.strip_prefix('+') {
        let unit_start = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if unit_start == 0 {
            return Err(ScheduleError::InvalidTime(format!("'{}' 缺少數字", input)));
        }
        let num: i64 = rest[..unit_start]
            .parse()
            .map_err(|_| ScheduleError::InvalidTime(format!("'{}' 數字無效", input)))?;

        let duration = match &rest[unit_start..] {
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::try_minutes(num),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::try_hours(num),
            "d" | "day" | "days" => Duration::try_days(num),
            "w" | "week" | "weeks" => Duration::try_weeks(num),
            unit => {
                return Err(ScheduleError::InvalidTime(format!("未知單位 '{}'，請用 m/h/d/w", unit)));
            }
        };
        return duration
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| ScheduleError::InvalidTime(format!("'{}' 超出範圍", input)));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M") {
        return resolve_local(tz, naive);
    }

    if let Ok(time) = NaiveTime::parse_from_str(input, "%H:%M") {
        let today = now.with_timezone(&tz).date_naive();
        let candidate = resolve_local(tz, today.and_time(time))?;
        if candidate > now {
            return Ok(candidate);
        }
        let tomorrow = today
            .succ_opt()
            .ok_or_else(|| ScheduleError::InvalidTime(format!("'{}' 超出範圍", input)))?;
        return resolve_local(tz, tomorrow.and_time(time));
    }

    Err(ScheduleError::InvalidTime(format!(
        "'{}'，請用 +30m、HH:MM 或 YYYY-MM-DD HH:MM",
        input
    )))
}

/// Local wall-clock time to UTC. Times skipped or repeated by a DST change
/// are rejected.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Result<DateTime<Utc>, ScheduleError> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(..) => Err(ScheduleError::InvalidTime(format!(
            "{} 在 {} 時區有兩個可能的時間",
            naive.format("%Y-%m-%d %H:%M"),
            tz
        ))),
        LocalResult::None => Err(ScheduleError::InvalidTime(format!(
            "{} 在 {} 時區不存在",
            naive.format("%Y-%m-%d %H:%M"),
            tz
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSender {
        sent: StdMutex<Vec<(i64, String)>>,
    }

    impl MessageSender for RecordingSender {
        async fn send_message(&self, chat_id: i64, text: &str, _reply_to: Option<i64>) -> Result<i64, String> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((chat_id, text.to_string()));
            Ok(sent.len() as i64)
        }

        async fn delete_message(&self, _chat_id: i64, _message_id: i64) -> Result<(), String> {
            Ok(())
        }
    }

    fn scheduler() -> (Arc<RecordingSender>, Scheduler<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        (sender.clone(), Scheduler::new(sender, chrono_tz::UTC))
    }

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap().and_utc()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_and_removes_record() {
        let (sender, scheduler) = scheduler();
        let id = scheduler
            .schedule(-100, "standup time", Utc::now() + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(scheduler.len().await, 1);

        tokio::time::sleep(std::time::Duration::from_secs(31 * 60)).await;

        assert_eq!(*sender.sent.lock().unwrap(), vec![(-100, "standup time".to_string())]);
        assert!(scheduler.list().await.is_empty());
        assert!(!scheduler.cancel(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_never_fires() {
        let (sender, scheduler) = scheduler();
        let id = scheduler
            .schedule(-100, "never", Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        assert!(scheduler.cancel(id).await);
        assert!(!scheduler.cancel(id).await);

        tokio::time::sleep(std::time::Duration::from_secs(10 * 60)).await;
        assert!(sender.sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_uses_stable_ids() {
        let (sender, scheduler) = scheduler();
        let first = scheduler.schedule(-1, "one", Utc::now() + Duration::hours(1)).await.unwrap();
        let second = scheduler.schedule(-1, "two", Utc::now() + Duration::hours(2)).await.unwrap();
        let third = scheduler.schedule(-1, "three", Utc::now() + Duration::hours(3)).await.unwrap();

        // Removing the first doesn't shift the others' ids
        assert!(scheduler.cancel(first).await);
        assert!(scheduler.cancel(third).await);

        let remaining: Vec<u64> = scheduler.list().await.iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![second]);

        tokio::time::sleep(std::time::Duration::from_secs(4 * 3600)).await;
        assert_eq!(*sender.sent.lock().unwrap(), vec![(-1, "two".to_string())]);
    }

    #[tokio::test]
    async fn test_rejects_past_and_empty() {
        let (_, scheduler) = scheduler();
        assert_eq!(
            scheduler.schedule(-1, "late", Utc::now() - Duration::minutes(1)).await,
            Err(ScheduleError::InPast)
        );
        assert_eq!(
            scheduler.schedule(-1, "   ", Utc::now() + Duration::minutes(1)).await,
            Err(ScheduleError::EmptyText)
        );
        assert_eq!(scheduler.len().await, 0);
    }

    #[tokio::test]
    async fn test_list_in_creation_order() {
        let (_, scheduler) = scheduler();
        scheduler.schedule(-1, "later", Utc::now() + Duration::hours(5)).await.unwrap();
        scheduler.schedule(-2, "sooner", Utc::now() + Duration::hours(1)).await.unwrap();

        let texts: Vec<String> = scheduler.list().await.into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["later", "sooner"]);
    }

    #[test]
    fn test_parse_relative() {
        let now = utc("2026-03-01 12:00");
        assert_eq!(parse_fire_time("+30m", chrono_tz::UTC, now).unwrap(), utc("2026-03-01 12:30"));
        assert_eq!(parse_fire_time("+2h", chrono_tz::UTC, now).unwrap(), utc("2026-03-01 14:00"));
        assert_eq!(parse_fire_time("+1d", chrono_tz::UTC, now).unwrap(), utc("2026-03-02 12:00"));
        assert_eq!(parse_fire_time("+1w", chrono_tz::UTC, now).unwrap(), utc("2026-03-08 12:00"));
    }

    #[test]
    fn test_parse_absolute_in_timezone() {
        let now = utc("2026-03-01 00:00");
        let taipei = chrono_tz::Asia::Taipei;
        assert_eq!(
            parse_fire_time("2026-03-01 09:00", taipei, now).unwrap(),
            utc("2026-03-01 01:00")
        );
    }

    #[test]
    fn test_parse_clock_time_next_occurrence() {
        let taipei = chrono_tz::Asia::Taipei;
        // 10:00 in Taipei
        let now = utc("2026-03-01 02:00");
        assert_eq!(parse_fire_time("12:30", taipei, now).unwrap(), utc("2026-03-01 04:30"));
        // Already past today, so tomorrow
        assert_eq!(parse_fire_time("08:00", taipei, now).unwrap(), utc("2026-03-02 00:00"));
    }

    #[test]
    fn test_parse_rejects_dst_gaps_and_overlaps() {
        let ny = chrono_tz::America::New_York;
        let now = utc("2026-01-01 00:00");
        // Clocks jump from 02:00 to 03:00 on 2026-03-08
        assert!(matches!(
            parse_fire_time("2026-03-08 02:30", ny, now),
            Err(ScheduleError::InvalidTime(_))
        ));
        // 01:30 happens twice on 2026-11-01
        assert!(matches!(
            parse_fire_time("2026-11-01 01:30", ny, now),
            Err(ScheduleError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_parse_invalid() {
        let now = Utc::now();
        for input in ["invalid", "+", "+30x", "+m", "25:00", "2026-13-01 10:00"] {
            assert!(parse_fire_time(input, chrono_tz::UTC, now).is_err(), "{input}");
        }
    }
}
