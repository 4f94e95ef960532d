//! Small string helpers shared by the formatters and the log forwarder.

/// Escape `&`, `<`, `>` and `"` for Telegram HTML parse mode. Safe inside
/// double-quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Cut `text` to at most `limit` characters, ending with `suffix` when cut.
pub fn truncate_chars(text: &str, limit: usize, suffix: &str) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let budget = limit.saturating_sub(suffix.chars().count());
    let mut out: String = text.chars().take(budget).collect();
    out.push_str(suffix);
    out
}
