/// Largest byte index `<= max` that falls on a UTF-8 char boundary of `s`.
pub(crate) fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut cut = max;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Truncate `text` to at most `max_bytes`, cutting at a char boundary and
/// appending a `[truncated: N bytes omitted]` suffix when anything was cut.
/// The suffix is not counted against `max_bytes`.
pub(crate) fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let cut = floor_char_boundary(text, max_bytes);
    let omitted = text.len() - cut;
    format!("{}[truncated: {omitted} bytes omitted]", &text[..cut])
}

/// Extract the first JSON object or array from oracle output.
///
/// Models frequently wrap structured replies in markdown fences or prose;
/// this scans for the outermost balanced `{...}` or `[...]` span, honoring
/// string literals and escapes. Returns `None` when no balanced span exists.
pub(crate) fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Whether `needle` occurs in `haystack` as a standalone token (not embedded
/// in a longer identifier). Used for grounding checks on task ids like `t2`.
pub(crate) fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(pos) = haystack[search_from..].find(needle) {
        let at = search_from + pos;
        let before_ok = at == 0
            || !haystack[..at]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        let after = at + needle.len();
        let after_ok = after >= haystack.len()
            || !haystack[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        search_from = at + needle.len();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_noop_within_limit() {
        assert_eq!(truncate_text("short", 100), "short");
        assert_eq!(truncate_text("exact", 5), "exact");
    }

    #[test]
    fn truncate_cuts_and_annotates() {
        let out = truncate_text(&"a".repeat(100), 10);
        assert!(out.starts_with("aaaaaaaaaa["));
        assert!(out.contains("[truncated: 90 bytes omitted]"));
    }

    #[test]
    fn truncate_preserves_utf8() {
        // "é" is 2 bytes; a cut at byte 5 would split a char.
        let out = truncate_text("ééééé", 5);
        assert!(out.starts_with("éé"));
        assert!(out.contains("[truncated:"));
    }

    #[test]
    fn extract_json_plain_object() {
        assert_eq!(extract_json(r#"{"a": 1}"#), Some(r#"{"a": 1}"#));
    }

    #[test]
    fn extract_json_strips_fences_and_prose() {
        let text = "Here is the plan:\n```json\n{\"tasks\": []}\n```\nDone.";
        assert_eq!(extract_json(text), Some("{\"tasks\": []}"));
    }

    #[test]
    fn extract_json_handles_nested_and_strings() {
        let text = r#"note {"a": {"b": "} tricky"}, "c": [1, 2]} trailing"#;
        assert_eq!(
            extract_json(text),
            Some(r#"{"a": {"b": "} tricky"}, "c": [1, 2]}"#)
        );
    }

    #[test]
    fn extract_json_array() {
        assert_eq!(extract_json("result: [1, 2, 3]!"), Some("[1, 2, 3]"));
    }

    #[test]
    fn extract_json_none_when_unbalanced() {
        assert_eq!(extract_json("{\"open\": "), None);
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn contains_token_word_boundaries() {
        assert!(contains_token("see task t2 for details", "t2"));
        assert!(contains_token("(t2)", "t2"));
        assert!(contains_token("t2", "t2"));
        assert!(!contains_token("t21 is unrelated", "t2"));
        assert!(!contains_token("at2", "t2"));
        assert!(!contains_token("chart_t2x", "t2"));
        assert!(!contains_token("anything", ""));
    }
}
