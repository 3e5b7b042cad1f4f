//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Greeting event model and its flattened text codec."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! Text encoding for greeting events travelling through the topic and queue.
//!
//! The wire form is `Greeting: <text> || Visitor IP: <origin>`. Inside a field
//! every `\` and `|` is escaped with a backslash, so the delimiter can only
//! ever appear once, between the two fields. Text without those characters
//! encodes exactly as the unescaped legacy form.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between the greeting field and the origin field.
pub const DELIMITER: &str = " || ";
/// Literal prefix of the greeting field.
pub const GREETING_PREFIX: &str = "Greeting: ";
/// Literal prefix of the origin field.
pub const ORIGIN_PREFIX: &str = "Visitor IP: ";

const ESCAPE: char = '\\';

/// Greeting produced for one request together with the caller's origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingEvent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl GreetingEvent {
    /// Build an event; a blank origin is treated as absent.
    pub fn new(text: impl Into<String>, origin_id: Option<String>) -> Self {
        Self {
            text: text.into(),
            origin_id: origin_id.filter(|origin| !origin.trim().is_empty()),
        }
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin_id.as_deref()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("greeting text is empty")]
    EmptyText,
}

/// Why a queued body could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformation {
    MissingDelimiter,
    ExtraDelimiters(usize),
    InvalidEscape,
    EmptyGreeting,
}

impl fmt::Display for Malformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformation::MissingDelimiter => f.write_str("delimiter not found"),
            Malformation::ExtraDelimiters(count) => write!(f, "{count} delimiters, expected 1"),
            Malformation::InvalidEscape => f.write_str("invalid escape sequence"),
            Malformation::EmptyGreeting => f.write_str("greeting field is empty"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed message ({reason}): {raw:?}")]
    MalformedMessage { raw: String, reason: Malformation },
}

impl DecodeError {
    fn malformed(raw: &str, reason: Malformation) -> Self {
        DecodeError::MalformedMessage {
            raw: raw.to_owned(),
            reason,
        }
    }

    /// Raw body that failed to decode, for diagnostics.
    pub fn raw(&self) -> &str {
        match self {
            DecodeError::MalformedMessage { raw, .. } => raw,
        }
    }

    pub fn reason(&self) -> Malformation {
        match self {
            DecodeError::MalformedMessage { reason, .. } => *reason,
        }
    }
}

/// Serialise an event into its single-string wire form.
pub fn encode_event(event: &GreetingEvent) -> Result<String, EncodingError> {
    if event.text.trim().is_empty() {
        return Err(EncodingError::EmptyText);
    }
    let text = escape_field(&event.text);
    let origin = escape_field(event.origin().unwrap_or_default());
    let mut encoded = String::with_capacity(
        GREETING_PREFIX.len() + text.len() + DELIMITER.len() + ORIGIN_PREFIX.len() + origin.len(),
    );
    encoded.push_str(GREETING_PREFIX);
    encoded.push_str(&text);
    encoded.push_str(DELIMITER);
    encoded.push_str(ORIGIN_PREFIX);
    encoded.push_str(&origin);
    Ok(encoded)
}

/// Parse a wire string back into an event. Never panics; any input that does
/// not split into exactly two fields is reported as malformed.
pub fn decode_event(raw: &str) -> Result<GreetingEvent, DecodeError> {
    let positions = delimiter_positions(raw);
    let at = match positions.as_slice() {
        [] => return Err(DecodeError::malformed(raw, Malformation::MissingDelimiter)),
        [at] => *at,
        many => {
            return Err(DecodeError::malformed(
                raw,
                Malformation::ExtraDelimiters(many.len()),
            ))
        }
    };

    let head = &raw[..at];
    let tail = &raw[at + DELIMITER.len()..];
    let text = unescape_field(head.strip_prefix(GREETING_PREFIX).unwrap_or(head))
        .ok_or_else(|| DecodeError::malformed(raw, Malformation::InvalidEscape))?;
    if text.trim().is_empty() {
        return Err(DecodeError::malformed(raw, Malformation::EmptyGreeting));
    }
    let origin = unescape_field(tail.strip_prefix(ORIGIN_PREFIX).unwrap_or(tail))
        .ok_or_else(|| DecodeError::malformed(raw, Malformation::InvalidEscape))?;

    Ok(GreetingEvent::new(text, Some(origin)))
}

/// Escape `\` and `|` so a field can never contain the delimiter.
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if !field.contains([ESCAPE, '|']) {
        return Cow::Borrowed(field);
    }
    let mut escaped = String::with_capacity(field.len() + 4);
    for ch in field.chars() {
        if ch == ESCAPE || ch == '|' {
            escaped.push(ESCAPE);
        }
        escaped.push(ch);
    }
    Cow::Owned(escaped)
}

/// Reverse [`escape_field`]. Returns `None` on a dangling or unknown escape.
pub fn unescape_field(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch == ESCAPE {
            match chars.next() {
                Some(next @ (ESCAPE | '|')) => out.push(next),
                _ => return None,
            }
        } else {
            out.push(ch);
        }
    }
    Some(out)
}

// Byte offsets of unescaped delimiters. The delimiter is ASCII, so every
// offset found here is a char boundary.
fn delimiter_positions(raw: &str) -> Vec<usize> {
    let bytes = raw.as_bytes();
    let needle = DELIMITER.as_bytes();
    let mut positions = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' {
            index += 2;
            continue;
        }
        if bytes[index..].starts_with(needle) {
            positions.push(index);
            index += needle.len();
            continue;
        }
        index += 1;
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_reference_message() {
        let event = decode_event("Greeting: Hello world || Visitor IP: 10.0.0.1").expect("decodes");
        assert_eq!(event.text, "Hello world");
        assert_eq!(event.origin(), Some("10.0.0.1"));
    }

    #[test]
    fn garbage_without_delimiter_is_malformed() {
        let err = decode_event("garbage-no-delimiter").expect_err("must fail");
        assert_eq!(err.reason(), Malformation::MissingDelimiter);
        assert_eq!(err.raw(), "garbage-no-delimiter");
    }

    #[test]
    fn repeated_delimiter_is_malformed() {
        let raw = "Greeting: a || b || Visitor IP: 1.2.3.4";
        let err = decode_event(raw).expect_err("must fail");
        assert_eq!(err.reason(), Malformation::ExtraDelimiters(2));
        assert!(err.to_string().contains("2 delimiters"));
    }

    #[test]
    fn plain_text_matches_the_legacy_wire_form() {
        let event = GreetingEvent::new("Lorem ipsum dolor.", Some("203.0.113.9".into()));
        assert_eq!(
            encode_event(&event).unwrap(),
            "Greeting: Lorem ipsum dolor. || Visitor IP: 203.0.113.9"
        );
    }

    #[test]
    fn delimiter_inside_text_survives_a_round_trip() {
        let tricky = [
            "pipes || inside",
            "trailing backslash \\",
            "\\|| mixed \\\\ | escapes",
            "Visitor IP: fake || Greeting: nested",
            "ünïcödé | text",
        ];
        for text in tricky {
            let event = GreetingEvent::new(text, Some("10.0.0.1 || spoof".into()));
            let encoded = encode_event(&event).expect("encodes");
            assert_eq!(delimiter_positions(&encoded).len(), 1, "{encoded}");
            assert_eq!(decode_event(&encoded).expect("decodes"), event);
        }
    }

    #[test]
    fn absent_origin_round_trips() {
        let event = GreetingEvent::new("Salve.", None);
        let encoded = encode_event(&event).unwrap();
        assert_eq!(encoded, "Greeting: Salve. || Visitor IP: ");
        assert_eq!(decode_event(&encoded).unwrap(), event);
        assert_eq!(GreetingEvent::new("x", Some("   ".into())).origin(), None);
    }

    #[test]
    fn empty_text_cannot_be_encoded() {
        let event = GreetingEvent::new("  ", Some("10.0.0.1".into()));
        assert_eq!(encode_event(&event), Err(EncodingError::EmptyText));
        let err = decode_event("Greeting:  || Visitor IP: 10.0.0.1").expect_err("empty");
        assert_eq!(err.reason(), Malformation::EmptyGreeting);
    }

    #[test]
    fn bad_escapes_are_malformed_not_panics() {
        let err = decode_event("Greeting: bad \\q || Visitor IP: x").expect_err("bad escape");
        assert_eq!(err.reason(), Malformation::InvalidEscape);
        // escaped multi-byte char must not split a code point
        assert!(decode_event("Greeting: \\é || Visitor IP: x").is_err());
        assert!(decode_event("\\").is_err());
        assert!(decode_event("").is_err());
    }

    #[test]
    fn missing_prefixes_are_tolerated() {
        let event = decode_event("hello || 192.0.2.1").expect("decodes");
        assert_eq!(event.text, "hello");
        assert_eq!(event.origin(), Some("192.0.2.1"));
    }
}
