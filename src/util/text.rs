//! Text truncation on character boundaries.

/// Marker appended when text is cut.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Cut `s` to at most `max_bytes` bytes without splitting a code point.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    &s[..cutoff]
}

/// Cut `s` to at most `max_chars` characters, appending [`TRUNCATION_MARKER`] when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &s[..byte_idx]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_utf8_never_splits_codepoints() {
        let s = "ab\u{1F600}cd";
        assert_eq!(truncate_utf8(s, 0), "");
        assert_eq!(truncate_utf8(s, 2), "ab");
        assert_eq!(truncate_utf8(s, 3), "ab");
        assert_eq!(truncate_utf8(s, 5), "ab");
        assert_eq!(truncate_utf8(s, 6), "ab\u{1F600}");
    }

    #[test]
    fn truncate_chars_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("h\u{e9}llo", 10), "h\u{e9}llo");
        assert_eq!(truncate_chars("h\u{e9}llo", 2), format!("h\u{e9}{TRUNCATION_MARKER}"));
    }
}
