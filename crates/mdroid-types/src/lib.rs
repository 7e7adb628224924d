//! `mdroid-types` – shared data model for the MDroid vehicle hub.
//!
//! Every other crate in the workspace speaks in terms of these types:
//!
//! - [`Entry`] – one canonical key/value pair in the state store together
//!   with the time it was last written.
//! - [`StateChange`] – what a write looked like, handed to hooks and to
//!   change-feed subscribers.
//! - [`Message`] – an outbound command for the microcontroller.
//! - [`AckCondition`] – the state key/value that confirms a command took
//!   effect.
//! - [`StateValue`] – typed views (`bool`, `f64`, `String`) over the
//!   canonical string form.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Normalise a key to its canonical form: surrounding whitespace trimmed,
/// inner spaces replaced by `_`, upper-cased.
///
/// ```
/// assert_eq!(mdroid_types::canonical_key(" acc power "), "ACC_POWER");
/// ```
pub fn canonical_key(key: &str) -> String {
    key.trim().replace(' ', "_").to_uppercase()
}

/// A single value held by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// Canonical textual form, see [`StateValue`] for typed access.
    pub value: String,
    #[serde(rename = "lastUpdate")]
    pub last_update: DateTime<Utc>,
}

impl Entry {
    /// Build an entry stamped with the current time.
    pub fn now(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_update: Utc::now(),
        }
    }

    /// Time elapsed since this entry was written. Clock skew that would make
    /// the age negative is reported as zero.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.last_update).to_std().unwrap_or_default()
    }

    /// Parse the stored string as `T`.
    pub fn parse<T: StateValue>(&self) -> Result<T, StateError> {
        T::parse(&self.value).ok_or_else(|| StateError::Parse {
            key: self.key.clone(),
            value: self.value.clone(),
            kind: T::KIND,
        })
    }
}

/// One write to the state store, as observed by hooks and change-feed
/// subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: String,
    pub entry: Entry,
    pub previous: Option<Entry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed access
// ─────────────────────────────────────────────────────────────────────────────

/// The typed views a caller may request over a canonical string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Float,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Float => write!(f, "float"),
            ValueKind::String => write!(f, "string"),
        }
    }
}

/// A type that can be parsed out of a canonical state value.
///
/// Parsing never mutates storage; failures are reported to the caller who
/// picks the fallback.
pub trait StateValue: Sized {
    const KIND: ValueKind;

    fn parse(raw: &str) -> Option<Self>;
}

impl StateValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("TRUE") {
            Some(true)
        } else if raw.eq_ignore_ascii_case("FALSE") {
            Some(false)
        } else {
            None
        }
    }
}

impl StateValue for f64 {
    const KIND: ValueKind = ValueKind::Float;

    fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok()
    }
}

impl StateValue for String {
    const KIND: ValueKind = ValueKind::String;

    fn parse(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

/// Canonical textual form of a boolean.
pub fn bool_text(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound commands
// ─────────────────────────────────────────────────────────────────────────────

/// An outbound command for the microcontroller.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub text: String,
    /// `true` when the producer waits for a state acknowledgment.
    pub awaiting_ack: bool,
    /// A message still queued after this instant is dropped unsent.
    pub deadline: Option<Instant>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            awaiting_ack: false,
            deadline: None,
        }
    }

    /// Drop the message if it has not reached the wire within `ttl`.
    pub fn with_deadline(mut self, ttl: Duration) -> Self {
        self.deadline = Some(Instant::now() + ttl);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// The state update that confirms a command physically happened.
///
/// Matching is on a fixed key, not on a correlated request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckCondition {
    pub key: String,
    pub value: String,
}

impl AckCondition {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: canonical_key(key),
            value: value.to_uppercase(),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        entry.key == self.key && entry.value.eq_ignore_ascii_case(&self.value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from reading the state store or the settings store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Cannot parse {key}={value:?} as {kind}")]
    Parse {
        key: String,
        value: String,
        kind: ValueKind,
    },
}

/// Failure reported by a hook callback. Isolated by the dispatcher.
#[derive(Error, Debug)]
pub enum HookError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Hook failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_normalises_case_and_spaces() {
        assert_eq!(canonical_key("acc_power"), "ACC_POWER");
        assert_eq!(canonical_key("  main voltage raw"), "MAIN_VOLTAGE_RAW");
        assert_eq!(canonical_key("mdroid.autolock"), "MDROID.AUTOLOCK");
    }

    #[test]
    fn bool_parse_is_case_insensitive() {
        assert_eq!(<bool as StateValue>::parse("TRUE"), Some(true));
        assert_eq!(<bool as StateValue>::parse("false"), Some(false));
        assert_eq!(<bool as StateValue>::parse("1"), None);
    }

    #[test]
    fn entry_parse_reports_kind_on_failure() {
        let entry = Entry::now("MAIN_VOLTAGE", "n/a");
        let err = entry.parse::<f64>().unwrap_err();
        assert_eq!(
            err,
            StateError::Parse {
                key: "MAIN_VOLTAGE".to_string(),
                value: "n/a".to_string(),
                kind: ValueKind::Float,
            }
        );
        assert!(err.to_string().contains("float"));
    }

    #[test]
    fn entry_parse_float_and_string() {
        let entry = Entry::now("AUX_CURRENT", "12.250");
        assert!((entry.parse::<f64>().unwrap() - 12.25).abs() < f64::EPSILON);
        assert_eq!(entry.parse::<String>().unwrap(), "12.250");
    }

    #[test]
    fn message_deadline_expires() {
        let msg = Message::new("powerOn:BOARD").with_deadline(Duration::ZERO);
        assert!(msg.is_expired());
        assert!(!Message::new("powerOn:BOARD").is_expired());
    }

    #[test]
    fn ack_condition_matches_canonical_entry() {
        let ack = AckCondition::new("angel_eyes_power", "true");
        assert!(ack.matches(&Entry::now("ANGEL_EYES_POWER", "TRUE")));
        assert!(!ack.matches(&Entry::now("ANGEL_EYES_POWER", "FALSE")));
        assert!(!ack.matches(&Entry::now("BOARD_POWER", "TRUE")));
    }

    #[test]
    fn entry_serialises_with_last_update_field() {
        let entry = Entry::now("KEY_STATE", "TRUE");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("lastUpdate"));
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
