//! Shrinking tool output before it goes back into the engine context.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default cap on a single tool result fed back to the engine.
pub const MAX_TOOL_RESULT_BYTES: usize = 16_384;

/// Inline binary payloads: base64 data URIs and long runs of hex.
static BINARY_BLOB: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"data:[\w/+.\-]+;base64,[A-Za-z0-9+/=]{16,}|\b[0-9a-fA-F]{256,}\b").ok()
});

/// Replace binary blobs with a size note, drop control characters other
/// than newline and tab, and cut the result to `max_bytes` on a character
/// boundary.
pub fn sanitize_tool_output(raw: &str, max_bytes: usize) -> String {
    let stripped = match BINARY_BLOB.as_ref() {
        Some(re) => re
            .replace_all(raw, |caps: &regex::Captures| {
                format!("[binary data omitted: {} bytes]", caps[0].len())
            })
            .into_owned(),
        None => raw.to_string(),
    };
    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    truncate_on_char_boundary(&cleaned, max_bytes)
}

/// `text` cut to at most `max_bytes` (plus a marker) without splitting a
/// UTF-8 sequence.
pub fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[output truncated, {} of {} bytes shown]",
        &text[..end],
        end,
        text.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_untouched() {
        let text = "Found 3 results:\n\t- one\n\t- two";
        assert_eq!(sanitize_tool_output(text, MAX_TOOL_RESULT_BYTES), text);
    }

    #[test]
    fn test_data_uri_replaced() {
        let payload = "QUJD".repeat(100);
        let text = format!("img: data:image/png;base64,{payload} end");
        let out = sanitize_tool_output(&text, MAX_TOOL_RESULT_BYTES);
        assert!(!out.contains(&payload));
        assert!(out.contains("[binary data omitted:"));
        assert!(out.ends_with(" end"));
    }

    #[test]
    fn test_hex_dump_replaced_but_short_hex_kept() {
        let dump = "ab".repeat(200);
        let out = sanitize_tool_output(&format!("sha {dump}"), MAX_TOOL_RESULT_BYTES);
        assert!(!out.contains(&dump));
        let short = "deadbeef";
        assert_eq!(sanitize_tool_output(short, MAX_TOOL_RESULT_BYTES), short);
    }

    #[test]
    fn test_control_characters_dropped() {
        assert_eq!(sanitize_tool_output("a\u{0007}b\r\nc", 100), "ab\nc");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "é".repeat(10);
        let out = truncate_on_char_boundary(&text, 5);
        assert!(out.starts_with("éé\n"));
        assert!(out.contains("4 of 20 bytes"));
        assert_eq!(truncate_on_char_boundary("short", 10), "short");
    }
}
