//! Wire decoding for live-channel messages.
//!
//! Two message shapes arrive on live channels:
//!
//! - Object streams send one JSON object per message:
//!   `{"event_type": "ADD", "Kind": "deployment", "Object": {...}}`
//! - Provisioning log streams send a JSON array of stream entries whose
//!   `Values.data` is itself JSON text describing an `apply_complete` or
//!   `diagnostic` record.
//!
//! [`parse_message`] accepts either and returns typed [`LiveEvent`]s. A
//! malformed message yields a [`ParseError`]; the caller logs and drops it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ParseError;

/// Object kind assigned to events decoded from provisioning log streams.
pub const INFRA_RESOURCE_KIND: &str = "infra_resource";

/// Discriminant of a decoded live event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Add,
    Update,
    Delete,
    Diagnostic,
    ApplyComplete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "ADD",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Diagnostic => "DIAGNOSTIC",
            EventKind::ApplyComplete => "APPLY_COMPLETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(EventKind::Add),
            "UPDATE" => Ok(EventKind::Update),
            "DELETE" => Ok(EventKind::Delete),
            "DIAGNOSTIC" => Ok(EventKind::Diagnostic),
            "APPLY_COMPLETE" => Ok(EventKind::ApplyComplete),
            other => Err(ParseError::UnknownEventType {
                event_type: other.to_string(),
            }),
        }
    }
}

/// A decoded live event: what happened, to what kind of object, and the raw object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    pub kind: EventKind,
    pub object_kind: String,
    pub payload: Value,
}

impl LiveEvent {
    pub fn new(kind: EventKind, object_kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            object_kind: object_kind.into(),
            payload,
        }
    }
}

#[derive(Deserialize)]
struct ObjectEnvelope {
    event_type: Option<String>,
    #[serde(rename = "Kind", default)]
    kind: Option<String>,
    #[serde(rename = "Object")]
    object: Option<Value>,
}

#[derive(Deserialize)]
struct StreamEntry {
    #[serde(rename = "Values")]
    values: Option<StreamValues>,
}

#[derive(Deserialize)]
struct StreamValues {
    data: Option<String>,
}

/// Decode one raw live-channel message into zero or more events.
///
/// Stream records of types other than `apply_complete` and `diagnostic`
/// (plan summaries, version banners, ...) are skipped rather than rejected.
pub fn parse_message(raw: &str) -> Result<Vec<LiveEvent>, ParseError> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(_) => parse_object_event(value).map(|event| vec![event]),
        Value::Array(entries) => parse_stream_entries(entries),
        _ => Err(ParseError::UnexpectedShape {
            expected: "object event or array of stream entries",
        }),
    }
}

fn parse_object_event(value: Value) -> Result<LiveEvent, ParseError> {
    let envelope: ObjectEnvelope = serde_json::from_value(value)?;
    let event_type = envelope
        .event_type
        .ok_or(ParseError::MissingField { field: "event_type" })?;
    let kind: EventKind = event_type.parse()?;
    let payload = envelope
        .object
        .ok_or(ParseError::MissingField { field: "Object" })?;
    if !payload.is_object() {
        return Err(ParseError::UnexpectedShape {
            expected: "Object to be a JSON object",
        });
    }

    Ok(LiveEvent {
        kind,
        object_kind: envelope.kind.unwrap_or_default(),
        payload,
    })
}

fn parse_stream_entries(entries: Vec<Value>) -> Result<Vec<LiveEvent>, ParseError> {
    let mut events = Vec::with_capacity(entries.len());

    for (index, entry) in entries.into_iter().enumerate() {
        let entry: StreamEntry = serde_json::from_value(entry)
            .map_err(|source| ParseError::StreamEntry { index, source })?;
        let data = entry
            .values
            .and_then(|values| values.data)
            .ok_or(ParseError::MissingField {
                field: "Values.data",
            })?;
        let record: Value = serde_json::from_str(&data)
            .map_err(|source| ParseError::StreamEntry { index, source })?;

        let kind = match record.get("type").and_then(Value::as_str) {
            Some("apply_complete") => EventKind::ApplyComplete,
            Some("diagnostic") => EventKind::Diagnostic,
            _ => continue,
        };
        events.push(LiveEvent::new(kind, INFRA_RESOURCE_KIND, record));
    }

    Ok(events)
}
