//! The opaque structured unit carried by every relay direction.
//!
//! A [`Message`] is one JSON value kept as its original text. The relay only
//! checks that the text is syntactically valid JSON; it never looks inside, so
//! JSON-RPC requests, responses, notifications and batches all pass through
//! untouched.
//!
//! The duplex channel is newline-delimited, so a message must never contain a
//! raw line break. Single-line input is stored byte-for-byte. Multi-line input
//! (typically a pretty-printed POST body) is compacted by removing whitespace
//! outside string literals, which keeps string contents and key order intact.

use std::fmt;

use serde_json::value::RawValue;

/// One opaque JSON message.
#[derive(Clone)]
pub struct Message(Box<RawValue>);

impl Message {
    /// Parse `text` as a single JSON value.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let text = text.trim();
        if text.contains(['\n', '\r']) {
            let raw = RawValue::from_string(compact(text))?;
            Ok(Self(raw))
        } else {
            let raw: Box<RawValue> = serde_json::from_str(text)?;
            Ok(Self(raw))
        }
    }

    /// Parse a request body or stdout line given as bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::from_json(text),
            // Let serde_json produce a proper error for the invalid bytes.
            Err(_) => serde_json::from_slice::<Box<RawValue>>(bytes).map(Self),
        }
    }

    /// The message text, guaranteed to be a single line.
    pub fn as_str(&self) -> &str {
        self.0.get()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&self.as_str()).finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strip whitespace that sits outside JSON string literals.
fn compact(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if !c.is_ascii_whitespace() {
            out.push(c);
        }
    }
    out
}
