//! Inbound frame codec.
//!
//! The microcontroller writes a stream of flat JSON objects, one per frame,
//! with no delimiter or envelope.  [`FrameReader`] cuts complete objects out
//! of the byte stream; [`decode_frame`] classifies each value into a
//! [`FrameValue`] and normalises it into the store's canonical string form:
//!
//! | Wire value | Stored as |
//! |---|---|
//! | `true` / `false` | `"TRUE"` / `"FALSE"` |
//! | number | decimal string (`42`, `12.5`) |
//! | string | upper-cased |
//! | `null` | skipped |
//! | array / object | rejected, logged |
//!
//! A rejected pair never prevents the rest of its frame from being applied.

use mdroid_store::StateStore;
use mdroid_types::{bool_text, canonical_key};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Frames larger than this without closing are discarded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// A decoded wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameValue {
    Bool(bool),
    Number(Number),
    Text(String),
    Null,
    /// Arrays and nested objects; carries the JSON type name.
    Unsupported(&'static str),
}

impl FrameValue {
    pub fn classify(value: &Value) -> Self {
        match value {
            Value::Bool(b) => FrameValue::Bool(*b),
            Value::Number(n) => FrameValue::Number(n.clone()),
            Value::String(s) => FrameValue::Text(s.clone()),
            Value::Null => FrameValue::Null,
            Value::Array(_) => FrameValue::Unsupported("array"),
            Value::Object(_) => FrameValue::Unsupported("object"),
        }
    }

    /// Canonical store form, or `None` when the value is not stored.
    pub fn canonical(&self) -> Option<String> {
        match self {
            FrameValue::Bool(b) => Some(bool_text(*b).to_string()),
            FrameValue::Number(n) => Some(canonical_number(n)),
            FrameValue::Text(s) => Some(s.to_uppercase()),
            FrameValue::Null | FrameValue::Unsupported(_) => None,
        }
    }
}

/// Integral numbers keep their integer form; everything else uses the
/// shortest decimal that round-trips, never exponent notation.  Negative
/// zero is stored as `0`.
pub fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        i.to_string()
    } else if let Some(u) = n.as_u64() {
        u.to_string()
    } else {
        match n.as_f64() {
            Some(f) if f == 0.0 => "0".to_string(),
            Some(f) => f.to_string(),
            None => n.to_string(),
        }
    }
}

/// Problems found while decoding inbound data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame is a JSON {0}, not an object")]
    NotAnObject(&'static str),

    #[error("Unsupported {kind} value for key {key}")]
    Unsupported { key: String, kind: &'static str },

    #[error("Frame contains an empty key")]
    EmptyKey,

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Result of decoding one frame: the accepted pairs plus what was rejected.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DecodedFrame {
    pub pairs: Vec<(String, String)>,
    pub rejected: Vec<DecodeError>,
}

/// Decode a flat JSON object into canonical `(KEY, VALUE)` pairs.
pub fn decode_frame(frame: &Value) -> Result<DecodedFrame, DecodeError> {
    let Value::Object(map) = frame else {
        return Err(DecodeError::NotAnObject(json_kind(frame)));
    };

    let mut decoded = DecodedFrame::default();
    for (raw_key, raw_value) in map {
        let key = canonical_key(raw_key);
        if key.is_empty() {
            decoded.rejected.push(DecodeError::EmptyKey);
            continue;
        }
        match FrameValue::classify(raw_value) {
            FrameValue::Null => {}
            FrameValue::Unsupported(kind) => {
                decoded.rejected.push(DecodeError::Unsupported { key, kind });
            }
            value @ (FrameValue::Bool(_) | FrameValue::Number(_) | FrameValue::Text(_)) => {
                if let Some(canonical) = value.canonical() {
                    decoded.pairs.push((key, canonical));
                }
            }
        }
    }
    Ok(decoded)
}

/// Decode `frame` and write every accepted pair into `store`.
///
/// Returns the number of pairs applied.  Rejections are logged.
pub fn apply_frame(store: &StateStore, frame: &Value, device: &str) -> usize {
    let decoded = match decode_frame(frame) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(device = %device, error = %e, "ignoring frame");
            return 0;
        }
    };
    for rejected in &decoded.rejected {
        error!(device = %device, error = %rejected, "skipping pair");
    }
    if decoded.pairs.is_empty() && decoded.rejected.is_empty() {
        debug!(device = %device, "empty frame");
    }
    let applied = decoded.pairs.len();
    for (key, value) in decoded.pairs {
        store.set(&key, value);
    }
    applied
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream framing
// ─────────────────────────────────────────────────────────────────────────────

/// Accumulates raw serial bytes and yields complete JSON objects.
///
/// Whitespace between objects is ignored.  Bytes that cannot begin an object
/// are discarded up to the next `{`, so one corrupted frame costs at most
/// that frame.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, an error describing discarded bytes, or `None`
    /// when more input is needed.
    pub fn next_frame(&mut self) -> Option<Result<Value, DecodeError>> {
        let start = self.buf.iter().position(|b| !b.is_ascii_whitespace());
        let Some(start) = start else {
            self.buf.clear();
            return None;
        };
        self.buf.drain(..start);

        if self.buf[0] != b'{' {
            let discarded = self.discard_until_next_object(0);
            return Some(Err(DecodeError::Malformed(format!(
                "discarded {discarded} stray bytes"
            ))));
        }

        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset();
                self.buf.drain(..consumed);
                Some(Ok(value))
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    let discarded = self.buf.len();
                    self.buf.clear();
                    Some(Err(DecodeError::Malformed(format!(
                        "unterminated frame exceeded {MAX_FRAME_BYTES} bytes; discarded {discarded}"
                    ))))
                } else {
                    None
                }
            }
            Some(Err(e)) => {
                self.discard_until_next_object(1);
                Some(Err(DecodeError::Malformed(e.to_string())))
            }
            None => None,
        }
    }

    /// Drop bytes up to the first `{` at or after `from`; returns how many
    /// bytes were dropped.
    fn discard_until_next_object(&mut self, from: usize) -> usize {
        let next = self.buf[from.min(self.buf.len())..]
            .iter()
            .position(|&b| b == b'{')
            .map(|offset| offset + from);
        match next {
            Some(index) => {
                self.buf.drain(..index);
                index
            }
            None => {
                let dropped = self.buf.len();
                self.buf.clear();
                dropped
            }
        }
    }
}
