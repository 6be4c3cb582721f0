//! Cleanup of model output for Telegram's legacy Markdown.
//!
//! Telegram rejects a whole message when an entity is left open, so the
//! formatter only ever removes marker characters. [`sanitize`] is idempotent.

use regex::Regex;
use std::sync::LazyLock;

/// Telegram's hard limit per message.
pub const MAX_MESSAGE_LEN: usize = 4096;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+)$").expect("static regex"));

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[*+\-]\s+").expect("static regex"));

static FENCE_LANG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+#\-]+$").expect("static regex"));

fn is_emphasis(c: char) -> bool {
    c == '*' || c == '_'
}

/// Normalize model output into single-level emphasis and fenced code blocks.
pub fn sanitize(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    // Some(..) while inside a fence: (opening line, body lines)
    let mut fence: Option<(String, Vec<String>)> = None;

    for raw in text.lines() {
        let trimmed = raw.trim();

        if let Some(rest) = trimmed.strip_prefix("```") {
            match fence.take() {
                Some((open, body)) => {
                    flush_fence(&mut out, open, body);
                    // Anything after the closing fence is prose.
                    push_prose(&mut out, rest.trim_start_matches('`'));
                }
                None => {
                    let rest = rest.trim();
                    if let Some(inner) = rest.strip_suffix("```") {
                        // One-line fence: ```code```
                        let body = vec![inner.trim().to_string()];
                        flush_fence(&mut out, "```".to_string(), body);
                    } else if rest.is_empty() || FENCE_LANG.is_match(rest) {
                        fence = Some((format!("```{rest}"), Vec::new()));
                    } else {
                        fence = Some(("```".to_string(), vec![rest.to_string()]));
                    }
                }
            }
            continue;
        }

        match fence.as_mut() {
            Some((_, body)) => {
                let line = raw.trim_end();
                if !line.trim().is_empty() {
                    body.push(line.to_string());
                }
            }
            None => push_prose(&mut out, trimmed),
        }
    }

    // Unterminated fence gets closed.
    if let Some((open, body)) = fence {
        flush_fence(&mut out, open, body);
    }

    out.join("\n")
}

fn flush_fence(out: &mut Vec<String>, open: String, body: Vec<String>) {
    let body: Vec<String> = body.into_iter().filter(|l| !l.trim().is_empty()).collect();
    if body.is_empty() {
        return;
    }
    out.push(open);
    out.extend(body);
    out.push("```".to_string());
}

fn push_prose(out: &mut Vec<String>, line: &str) {
    let line = format_prose_line(line.trim());
    if !line.is_empty() {
        out.push(line);
    }
}

fn format_prose_line(line: &str) -> String {
    if line.is_empty() {
        return String::new();
    }

    let mut current = line.to_string();
    loop {
        let headed = match HEADING.captures(&current) {
            Some(caps) => {
                let title: String = caps[1].chars().filter(|&c| c != '*').collect();
                let title = title.trim();
                if title.is_empty() {
                    return String::new();
                }
                format!("*{title}*")
            }
            None => current.clone(),
        };
        let bulleted = BULLET.replace(&headed, "• ").into_owned();
        let next = normalize_markers(&bulleted);
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Marker cleanup repeated until nothing changes. Every pass either leaves
/// the line alone or removes characters, so this terminates.
fn normalize_markers(line: &str) -> String {
    let mut current = line.to_string();
    loop {
        let next = normalize_once(&current);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn normalize_once(line: &str) -> String {
    // Backtick runs collapse first, then backticks balance, so the inline
    // code mask below is well defined.
    let mut chars: Vec<char> = Vec::with_capacity(line.len());
    for c in line.chars() {
        if c == '`' && chars.last() == Some(&'`') {
            continue;
        }
        chars.push(c);
    }
    if chars.iter().filter(|&&c| c == '`').count() % 2 == 1
        && let Some(pos) = chars.iter().rposition(|&c| c == '`')
    {
        chars.remove(pos);
    }

    // Collapse ** / __ / *** runs to a single marker outside inline code.
    let mask = code_mask(&chars);
    let mut collapsed: Vec<char> = Vec::with_capacity(chars.len());
    let mut collapsed_mask: Vec<bool> = Vec::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        if !mask[i] && is_emphasis(c) && i > 0 && chars[i - 1] == c && !mask[i - 1] {
            continue;
        }
        collapsed.push(c);
        collapsed_mask.push(mask[i]);
    }

    // Markers wedged inside ASCII words (snake_case, 2*3) are not emphasis.
    let mut kept: Vec<char> = Vec::with_capacity(collapsed.len());
    let mut kept_mask: Vec<bool> = Vec::with_capacity(collapsed.len());
    for (i, &c) in collapsed.iter().enumerate() {
        if !collapsed_mask[i] && is_emphasis(c) {
            let prev = i.checked_sub(1).map(|j| collapsed[j]);
            let next = collapsed.get(i + 1).copied();
            let word = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
            if word(prev) && word(next) {
                continue;
            }
        }
        kept.push(c);
        kept_mask.push(collapsed_mask[i]);
    }

    // Balance * and _ outside inline code.
    for marker in ['*', '_'] {
        let positions: Vec<usize> = kept
            .iter()
            .enumerate()
            .filter(|&(i, &c)| c == marker && !kept_mask[i])
            .map(|(i, _)| i)
            .collect();
        if positions.len() % 2 == 1
            && let Some(&last) = positions.last()
        {
            kept.remove(last);
            kept_mask.remove(last);
        }
    }

    kept.into_iter().collect::<String>().trim().to_string()
}

/// `true` for characters strictly inside a pair of backticks.
fn code_mask(chars: &[char]) -> Vec<bool> {
    let mut inside = false;
    chars
        .iter()
        .map(|&c| {
            if c == '`' {
                inside = !inside;
                false
            } else {
                inside
            }
        })
        .collect()
}

/// Remove all markup characters, for the plain-text resend.
pub fn strip_markup(text: &str) -> String {
    text.chars().filter(|c| !matches!(c, '*' | '_' | '`')).collect()
}

/// Split text into chunks that fit in one Telegram message, preferring line
/// boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let mut cut = max_len;
        while !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // Limit is narrower than one character; emit it whole
            cut = remaining.chars().next().map_or(remaining.len(), char::len_utf8);
        }
        let cut = match remaining[..cut].rfind('\n') {
            Some(nl) if nl > 0 => nl,
            _ => cut,
        };
        chunks.push(remaining[..cut].to_string());
        remaining = remaining[cut..].trim_start_matches('\n');
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapses_emphasis() {
        assert_eq!(sanitize("***bold***"), "*bold*");
        assert_eq!(sanitize("**bold** and __it__"), "*bold* and _it_");
    }

    #[test]
    fn test_keeps_cjk_emphasis() {
        assert_eq!(sanitize("這是**重點**內容"), "這是*重點*內容");
    }

    #[test]
    fn test_strips_intraword_markers() {
        assert_eq!(sanitize("call snake_case_name now"), "call snakecasename now");
        assert_eq!(sanitize("2*3 is six"), "23 is six");
    }

    #[test]
    fn test_balances_markers() {
        assert_eq!(sanitize("unbalanced *star"), "unbalanced star");
        assert_eq!(sanitize("one `tick"), "one tick");
        assert_eq!(sanitize("*a* and *b"), "*a* and b");
    }

    #[test]
    fn test_inline_code_is_left_alone() {
        assert_eq!(sanitize("use `snake_case` here"), "use `snake_case` here");
        assert_eq!(sanitize("run `a**b`"), "run `a**b`");
    }

    #[test]
    fn test_drops_blank_lines_and_trims() {
        assert_eq!(sanitize("  first  \n\n\n   second\n  \n"), "first\nsecond");
    }

    #[test]
    fn test_code_block_reflow() {
        let input = "Here:\n\n```rust\nfn main() {\n\n\n    let my_var = 1;\n}\n```\n\nDone.";
        assert_eq!(
            sanitize(input),
            "Here:\n```rust\nfn main() {\n    let my_var = 1;\n}\n```\nDone."
        );
    }

    #[test]
    fn test_unterminated_fence_is_closed() {
        assert_eq!(sanitize("```\nprint(1)"), "```\nprint(1)\n```");
    }

    #[test]
    fn test_empty_fence_dropped() {
        assert_eq!(sanitize("a\n```\n\n```\nb"), "a\nb");
    }

    #[test]
    fn test_one_line_fence() {
        assert_eq!(sanitize("```ls -la```"), "```\nls -la\n```");
    }

    #[test]
    fn test_bullets_and_headings() {
        assert_eq!(sanitize("* one\n- two\n+ three"), "• one\n• two\n• three");
        assert_eq!(sanitize("## **Summary**"), "*Summary*");
        assert_eq!(sanitize("-5 degrees"), "-5 degrees");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "***bold*** text **more**",
            "a_*_b",
            "** a *b*",
            "# Title\n\n* item *one\n* item_two\n\n```py\nx = 1\n\n\ny = 2\n```",
            "``` `` ` ``` ` *_*_ _*",
            "mixed `code *star` *outside",
            "這是**重點**內容，還有__底線__",
            "```\nunterminated\n\n",
        ];
        for sample in samples {
            let once = sanitize(sample);
            let twice = sanitize(&once);
            assert_eq!(once, twice, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn test_never_leaves_odd_markers_in_prose() {
        let out = sanitize("*_`*_`*_ weird ** __ `` ***");
        for line in out.lines() {
            assert_eq!(line.matches('`').count() % 2, 0);
        }
    }

    #[test]
    fn test_strip_markup() {
        assert_eq!(strip_markup("*bold* _it_ `code`"), "bold it code");
    }

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("short", 10), vec!["short"]);
        let text = "line one\nline two\nline three";
        let chunks = split_message(text, 12);
        assert_eq!(chunks, vec!["line one", "line two", "line three"]);
        let long = "x".repeat(25);
        let chunks = split_message(&long, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "中".repeat(10);
        let chunks = split_message(&text, 10);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_limit_narrower_than_a_char() {
        let chunks = split_message("中文", 2);
        assert_eq!(chunks, vec!["中", "文"]);
        assert_eq!(split_message("ab", 0), vec!["a", "b"]);
    }
}
