//! Record model for device telemetry pulled from the controller.
//!
//! A record is one decoded telemetry unit (a log bundle or a device info
//! message). The payload is treated as opaque JSON beyond its type tag; what
//! flows to caches and callbacks is the canonical re-serialised byte form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of telemetry a record carries.
///
/// Selects both the controller endpoint and the decode schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Logs,
    Info,
}

impl RecordType {
    /// Get all record types.
    pub fn all() -> &'static [RecordType] {
        &[RecordType::Logs, RecordType::Info]
    }

    /// Path segment and display name for this record type.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Logs => "logs",
            RecordType::Info => "info",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logs" | "log" => Ok(RecordType::Logs),
            "info" => Ok(RecordType::Info),
            other => Err(RecordError::UnknownType(other.to_string())),
        }
    }
}

/// Errors raised while building a record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The decoded frame is not a JSON object.
    #[error("{kind} record must be a JSON object, got {found}")]
    NotAnObject { kind: RecordType, found: &'static str },

    /// Re-serialisation failed.
    #[error("failed to encode {kind} record: {source}")]
    Encode {
        kind: RecordType,
        #[source]
        source: serde_json::Error,
    },

    /// Unrecognised record type name.
    #[error("unknown record type '{0}' (expected 'logs' or 'info')")]
    UnknownType(String),
}

/// One decoded telemetry unit plus its canonical bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordType,
    payload: Value,
    bytes: Vec<u8>,
}

impl Record {
    /// Build a record from a decoded JSON value.
    ///
    /// Both log bundles and info messages are JSON objects on the wire, so any
    /// other JSON shape is rejected.
    pub fn from_value(kind: RecordType, payload: Value) -> Result<Self, RecordError> {
        if !payload.is_object() {
            return Err(RecordError::NotAnObject {
                kind,
                found: json_kind(&payload),
            });
        }

        let bytes =
            serde_json::to_vec(&payload).map_err(|source| RecordError::Encode { kind, source })?;

        Ok(Self {
            kind,
            payload,
            bytes,
        })
    }

    pub fn kind(&self) -> RecordType {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Canonical compact JSON encoding of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
