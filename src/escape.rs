//! Escaping for command text sent to the engine.
//!
//! The engine treats `[`, `]`, `*` and `?` as wildcard characters in paths
//! and uses the backtick as its escape character. Single-quoted literals
//! escape an embedded quote by doubling it.

/// Characters escaped by [`escape_wildcards`].
const WILDCARDS: [char; 5] = ['[', ']', '*', '?', '`'];

const ESCAPE: char = '`';

/// Escape wildcard characters (and the escape character itself) with a
/// backtick. With `escape_spaces`, whitespace is escaped too so the result
/// survives as a single bare word.
pub fn escape_wildcards(text: &str, escape_spaces: bool) -> String {
    let mut escaped = String::with_capacity(text.len() + 4);
    for c in text.chars() {
        if WILDCARDS.contains(&c) || (escape_spaces && c.is_whitespace()) {
            escaped.push(ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Reverse [`escape_wildcards`]: drop each escaping backtick and keep the
/// character after it. A trailing lone backtick is kept.
pub fn unescape_wildcards(text: &str) -> String {
    let mut unescaped = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            match chars.next() {
                Some(next) => unescaped.push(next),
                None => unescaped.push(c),
            }
        } else {
            unescaped.push(c);
        }
    }
    unescaped
}

/// Wrap `text` in single quotes, doubling any embedded single quote.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Parse a single-quoted literal produced by [`quote_literal`].
///
/// Returns `None` when `literal` is not quoted or contains an undoubled
/// quote.
pub fn parse_quoted_literal(literal: &str) -> Option<String> {
    let body = literal.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut parsed = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' && chars.next_if_eq(&'\'').is_none() {
            return None;
        }
        parsed.push(c);
    }
    Some(parsed)
}
