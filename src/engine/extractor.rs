//! Live `text` extraction from a reply that streams in as a partial JSON document.
//!
//! The flow streams `{"text": "...", "suggestedQuestions": [...], "products": [...]}`
//! token by token (or plain prose, without negotiation). `extract` is called
//! after every token with the whole accumulated string and returns the best
//! current value of `text`.

use std::sync::LazyLock;

use regex::Regex;

/// Matches a complete `"text": "..."` value.
static CLOSED_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"text"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid closed-text regex")
});

/// Matches a `"text": "...` value that may still be open.
static OPEN_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)"text"\s*:\s*"((?:[^"\\]|\\.)*)"#).expect("valid open-text regex")
});

const SIBLING_KEYS: &[&str] = &["\"suggestedQuestions\"", "\"products\""];

/// Per-request extraction state. Owned by one assembler for the lifetime of
/// a single push channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamAssemblyState {
    pub raw_accumulated_text: String,
    /// Set once a sibling key starts after a closed `text` value.
    pub frozen: bool,
    pub last_emitted_text: String,
}

impl StreamAssemblyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: &str) {
        self.raw_accumulated_text.push_str(chunk);
    }
}

/// Best current estimate of the final `text` field for `raw`.
///
/// `raw` must grow monotonically between calls. The result is also stored in
/// `state.last_emitted_text`.
pub fn extract(raw: &str, state: &mut StreamAssemblyState) -> String {
    if state.frozen {
        return state.last_emitted_text.clone();
    }

    let value = derive_text(raw, state);
    let value = match value {
        Some(v) if !v.is_empty() || state.last_emitted_text.is_empty() => v,
        _ => state.last_emitted_text.clone(),
    };
    state.last_emitted_text = value.clone();
    value
}

fn derive_text(raw: &str, state: &mut StreamAssemblyState) -> Option<String> {
    let body = strip_fence_opener(raw.trim_start());
    if body.is_empty() {
        return None;
    }
    if !body.starts_with('{') && !body.starts_with('[') {
        return Some(raw.to_string());
    }

    if let Some(closed) = CLOSED_TEXT.captures(body) {
        let span_end = closed.get(0).map(|m| m.end()).unwrap_or(body.len());
        let tail = &body[span_end..];
        if SIBLING_KEYS.iter().any(|key| tail.contains(key)) {
            state.frozen = true;
            return Some(unescape(&closed[1]));
        }
    }

    if let Some(text) = full_parse_text(body) {
        return Some(text);
    }

    if let Some(closed) = CLOSED_TEXT.captures(body) {
        return Some(unescape(&closed[1]));
    }

    OPEN_TEXT
        .captures(body)
        .map(|open| unescape(trim_dangling_escape(&open[1])))
}

/// Authoritative value when the accumulated text already parses as JSON.
pub fn full_parse_text(raw: &str) -> Option<String> {
    let body = strip_fence_closer(strip_fence_opener(raw.trim()));
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("text")?.as_str().map(String::from)
}

fn strip_fence_opener(s: &str) -> &str {
    match s.strip_prefix("```") {
        Some(rest) => rest.strip_prefix("json").unwrap_or(rest).trim_start(),
        None => s,
    }
}

fn strip_fence_closer(s: &str) -> &str {
    s.strip_suffix("```").unwrap_or(s).trim_end()
}

/// Drop an escape sequence cut off by the end of the stream so the partial
/// value stays a prefix of the final one.
fn trim_dangling_escape(s: &str) -> &str {
    let bytes = s.as_bytes();
    // A trailing odd run of backslashes cannot occur (the regex only takes
    // complete `\x` pairs), but `\u` needs four hex digits after it.
    if let Some(pos) = s.rfind("\\u") {
        let preceding = bytes[..pos].iter().rev().take_while(|b| **b == b'\\').count();
        if preceding % 2 == 0 {
            let hex = &s[pos + 2..];
            if hex.len() < 4 {
                return trim_dangling_escape(&s[..pos]);
            }
            // A high surrogate whose low half has not arrived yet.
            if let Some(code) = hex.get(..4).and_then(parse_hex4) {
                if (0xD800..0xDC00).contains(&code) && hex.len() < 10 {
                    return trim_dangling_escape(&s[..pos]);
                }
            }
        }
    }
    s
}

/// Single left-to-right pass over JSON string escapes.
///
/// Handles `\"`, `\n`, `\r`, `\t`, `\\`, `\/`, `\b`, `\f` and complete
/// `\uXXXX` (including surrogate pairs). Unknown escapes are kept verbatim.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.clone().take(4).collect();
                match parse_hex4(&hex) {
                    Some(code) => {
                        for _ in 0..4 {
                            chars.next();
                        }
                        if let Some(ch) = decode_utf16_unit(code, &mut chars) {
                            out.push(ch);
                        }
                    }
                    _ => out.push_str("\\u"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_hex4(hex: &str) -> Option<u16> {
    if hex.len() != 4 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

fn decode_utf16_unit(
    code: u16,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Option<char> {
    if !(0xD800..0xDC00).contains(&code) {
        return Some(char::decode_utf16([code]).next()?.unwrap_or('\u{FFFD}'));
    }
    // High surrogate: look for `\uDC00..\uDFFF` right after it.
    let lookahead: String = chars.clone().take(6).collect();
    if let Some(low_hex) = lookahead.strip_prefix("\\u") {
        if let Some(low) = parse_hex4(low_hex) {
            if (0xDC00..0xE000).contains(&low) {
                for _ in 0..6 {
                    chars.next();
                }
                return char::decode_utf16([code, low]).next()?.ok();
            }
        }
    }
    Some('\u{FFFD}')
}
