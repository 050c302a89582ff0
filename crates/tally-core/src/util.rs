//! Helpers shared by the remote adapters and the CLI.

use chrono::Utc;

/// Longest text kept by [`snippet`]
const SNIPPET_CHARS: usize = 180;

/// Wall clock in epoch milliseconds, the unit of every `updatedAt` stamp
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `Some` only when there is text left after trimming
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Base URL of a REST remote without its trailing slash, or `None` when the
/// scheme is not http(s)
pub fn http_base_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    ["http://", "https://"]
        .iter()
        .any(|scheme| raw.starts_with(scheme))
        .then(|| raw.trim_end_matches('/').to_string())
}

/// Trimmed prefix of `text` that fits on one line of a message
pub fn snippet(text: &str) -> String {
    text.trim().chars().take(SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_tokens_are_dropped() {
        assert_eq!(non_blank(Some(" \t".to_string())), None);
        assert_eq!(non_blank(Some(" s3cret ".to_string())).as_deref(), Some("s3cret"));
    }

    #[test]
    fn remote_urls_need_an_http_scheme() {
        assert_eq!(
            http_base_url("https://tally.example.com/").as_deref(),
            Some("https://tally.example.com")
        );
        assert_eq!(
            http_base_url("http://127.0.0.1:9000").as_deref(),
            Some("http://127.0.0.1:9000")
        );
        assert_eq!(http_base_url("tally.example.com"), None);
        assert_eq!(http_base_url("wss://tally.example.com"), None);
    }

    #[test]
    fn snippets_keep_multibyte_text_intact() {
        let body = "é".repeat(400);
        assert_eq!(snippet(&body).chars().count(), 180);
        assert_eq!(snippet("\n{\"error\":\"denied\"}\n"), "{\"error\":\"denied\"}");
    }
}
