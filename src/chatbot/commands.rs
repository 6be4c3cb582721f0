//! Admin commands, accepted in private chat from configured admins.

use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case", description = "管理指令：")]
pub enum Command {
    #[command(description = "顯示指令列表")]
    Help,
    #[command(description = "列出已知群組")]
    Groups,
    #[command(description = "列出排程訊息")]
    Schedules,
    #[command(description = "<群組編號> <時間> <內容> 排程訊息，時間可用 +30m、HH:MM 或 YYYY-MM-DD HH:MM")]
    Schedule(String),
    #[command(description = "<id> 取消排程")]
    Cancel(u64),
    #[command(description = "開啟 AI 回覆")]
    AiOn,
    #[command(description = "關閉 AI 回覆（計算仍會回應）")]
    AiOff,
    #[command(description = "<群組編號|all> 清除對話紀錄")]
    Clear(String),
    #[command(description = "目前狀態")]
    Status,
}

/// Parsed arguments of `/schedule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleArgs {
    pub group: u32,
    /// Unparsed fire time, e.g. `+30m` or `2026-03-01 09:00`.
    pub when: String,
    pub text: String,
}

pub fn parse_schedule_args(args: &str) -> Result<ScheduleArgs, String> {
    const USAGE: &str = "用法：/schedule <群組編號> <時間> <內容>";

    let (group, rest) = next_word(args).ok_or(USAGE)?;
    let group = group
        .trim_start_matches('#')
        .parse::<u32>()
        .map_err(|_| format!("群組編號無效\n{}", USAGE))?;

    let (first, rest) = next_word(rest).ok_or(USAGE)?;
    // The date form spans two words
    let (when, rest) = if is_date(first) {
        let (time, rest) = next_word(rest).ok_or(USAGE)?;
        (format!("{} {}", first, time), rest)
    } else {
        (first.to_string(), rest)
    };

    // Line breaks and spacing in the message are kept as typed
    let text = rest.trim().to_string();
    if text.is_empty() {
        return Err(USAGE.to_string());
    }

    Ok(ScheduleArgs { group, when, text })
}

/// Split off the first whitespace-delimited word, returning it and the untouched remainder.
fn next_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    Some(s.split_once(char::is_whitespace).unwrap_or((s, "")))
}

fn is_date(word: &str) -> bool {
    let parts: Vec<&str> = word.split('-').collect();
    parts.len() == 3
        && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// What `/clear` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    All,
    Group(u32),
}

pub fn parse_clear_target(args: &str) -> Result<ClearTarget, String> {
    let args = args.trim();
    if args.eq_ignore_ascii_case("all") {
        return Ok(ClearTarget::All);
    }
    args.trim_start_matches('#')
        .parse::<u32>()
        .map(ClearTarget::Group)
        .map_err(|_| "用法：/clear <群組編號|all>".to_string())
}
