use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};

pub fn now_utc_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))
}

/// `check_alliteration` -> `Check alliteration`
pub fn humanize_name(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let trimmed = spaced.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn truncate_chars(text: &str, max_len: Option<usize>) -> String {
    match max_len {
        Some(max_len) => text.chars().take(max_len).collect(),
        None => text.to_string(),
    }
}

/// Keep the tail of `text`, whole lines first, so the innermost context of an
/// error chain survives when it has to be cut to `max_len` characters.
pub fn tail_bounded(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }

    let mut lines = text.lines().rev();
    let Some(last) = lines.next() else {
        return String::new();
    };

    let last_len = last.chars().count();
    if last_len >= max_len {
        return last.chars().skip(last_len - max_len).collect();
    }

    let mut kept = vec![last];
    let mut used = last_len;
    for line in lines {
        let needed = line.chars().count() + 1;
        if used + needed > max_len {
            break;
        }
        used += needed;
        kept.push(line);
    }

    kept.reverse();
    kept.join("\n")
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    let hours = (seconds / 3600.0).floor();
    let minutes = ((seconds - hours * 3600.0) / 60.0).floor();
    let rest = seconds - hours * 3600.0 - minutes * 60.0;
    format!("{hours:02.0}h:{minutes:02.0}m:{rest:04.1}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_name_capitalizes_and_spaces() {
        assert_eq!(humanize_name("check_alliteration"), "Check alliteration");
        assert_eq!(humanize_name("_private"), "Private");
        assert_eq!(humanize_name(""), "");
    }

    #[test]
    fn truncate_chars_respects_limit() {
        assert_eq!(truncate_chars("abcdef", Some(3)), "abc");
        assert_eq!(truncate_chars("abcdef", None), "abcdef");
        assert_eq!(truncate_chars("äöü", Some(2)), "äö");
    }

    #[test]
    fn tail_bounded_keeps_trailing_lines() {
        let text = "frame one\nframe two\nframe three";
        assert_eq!(tail_bounded(text, 100), text);
        assert_eq!(tail_bounded(text, 21), "frame two\nframe three");
        assert_eq!(tail_bounded(text, 5), "three");
    }

    #[test]
    fn format_elapsed_renders_hours_minutes_seconds() {
        assert_eq!(format_elapsed(Duration::from_secs(3723)), "01h:02m:03.0s");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "00h:00m:01.5s");
    }
}
