//! Structured logging setup and payload redaction helpers

use tracing_subscriber::EnvFilter;

/// Maximum characters of a backend response body kept in errors and logs
pub const BODY_PREVIEW_CHARS: usize = 200;

/// Maximum characters of transcript text logged in debug mode
pub const TRANSCRIPT_PREVIEW_CHARS: usize = 60;

/// Output format for the subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log pipelines
    Json,
}

/// Install the global tracing subscriber; `RUST_LOG` overrides the default `info`
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // a second init (tests, embedding) is not an error worth surfacing
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis
pub fn truncate(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &value[..idx]),
        None => value.to_string(),
    }
}

/// Render an API key for logs, keeping only the prefix and last four characters
pub fn redact_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let prefix: String = chars[..3].iter().collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}…{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_is_unchanged() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 4), "héll…");
        assert_eq!(truncate("日本語テキスト", 3), "日本語…");
    }

    #[test]
    fn test_redact_key() {
        assert_eq!(redact_key("sk-proj-abcdefghijkl"), "sk-…ijkl");
        assert_eq!(redact_key("short"), "***");
        assert!(!redact_key("sk-proj-abcdefghijkl").contains("abcdefgh"));
    }
}
