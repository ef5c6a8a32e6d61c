//! Conversation title derivation from the first user message.
//!
//! Titles are the truncated first 100 characters of the message. A title is
//! updated lazily on the first assistant turn when it is still empty or a
//! truncation placeholder; later turns never touch it.

/// Maximum title length in characters (not bytes).
const TITLE_MAX_CHARS: usize = 100;

/// Derive a title from a user message: the first 100 characters, with a
/// `...` suffix when the message was longer. Counts characters so
/// multi-byte input is never split mid-codepoint.
pub fn truncate_title(message: &str) -> String {
    let message = message.trim();
    if message.chars().count() <= TITLE_MAX_CHARS {
        message.to_string()
    } else {
        let mut title: String = message.chars().take(TITLE_MAX_CHARS).collect();
        title.push_str("...");
        title
    }
}

/// Whether a stored title still needs to be set from the user's message.
///
/// Empty titles and bare placeholders count; anything a user or earlier
/// turn has set stays untouched.
pub fn needs_title(title: &str) -> bool {
    let title = title.trim();
    title.is_empty() || title.starts_with("...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_kept_whole() {
        assert_eq!(truncate_title("Explain tax codes"), "Explain tax codes");
    }

    #[test]
    fn test_exactly_100_chars_not_truncated() {
        let msg = "a".repeat(100);
        assert_eq!(truncate_title(&msg), msg);
    }

    #[test]
    fn test_long_message_truncated_with_ellipsis() {
        let msg = "b".repeat(150);
        let title = truncate_title(&msg);
        assert_eq!(title.chars().count(), 103);
        assert!(title.ends_with("..."));
        assert!(title.starts_with("bbb"));
    }

    #[test]
    fn test_multibyte_boundary_safe() {
        let msg = "é".repeat(150);
        let title = truncate_title(&msg);
        assert_eq!(title.chars().count(), 103);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(truncate_title("  hello  "), "hello");
    }

    #[test]
    fn test_needs_title() {
        assert!(needs_title(""));
        assert!(needs_title("   "));
        assert!(needs_title("..."));
        assert!(!needs_title("Explain tax codes"));
        assert!(!needs_title("Planning a trip..."));
    }
}
