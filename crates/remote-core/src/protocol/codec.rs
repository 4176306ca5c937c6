//! JSON line codec for remote session records.
//!
//! Wire format:
//! ```text
//! {"type":"<message type>", <payload fields>...}\n
//! ```
//! One JSON object per record, UTF-8, terminated by a single `\n`.  The
//! compact encoder escapes every control character inside strings, so a
//! serialized record never contains a raw newline before its terminator.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// The payload of one record: field name to JSON value, in insertion order.
pub type Fields = Map<String, Value>;

/// Name of the mandatory discriminator field.
pub const TYPE_FIELD: &str = "type";

/// Errors that can occur while encoding or decoding a record.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// serde_json rejected the bytes or the value.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The line parsed as JSON but not as an object.
    #[error("record is not a JSON object (found {0})")]
    NotAnObject(&'static str),

    /// A payload struct did not serialize to a JSON object.
    #[error("payload is not a JSON object")]
    PayloadNotAnObject,
}

// ── Serializer seam ───────────────────────────────────────────────────────────

/// Converts records to and from their on-wire bytes.
///
/// Transports hold an `Arc<dyn Serializer>` so that tests and alternative
/// encodings can be swapped in without touching the connection code.
pub trait Serializer: Send + Sync {
    /// Encodes `fields` with `type = msg_type` as one newline-terminated
    /// record.  A `type` key already present in `fields` is overridden.
    fn serialize(&self, msg_type: &str, fields: &Fields) -> Result<Vec<u8>, ProtocolError>;

    /// Decodes one record (without its trailing newline) into its fields,
    /// including `type`.
    fn deserialize(&self, line: &[u8]) -> Result<Fields, ProtocolError>;
}

/// The production [`Serializer`]: compact serde_json output.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, msg_type: &str, fields: &Fields) -> Result<Vec<u8>, ProtocolError> {
        let mut record = Map::with_capacity(fields.len() + 1);
        record.insert(TYPE_FIELD.to_string(), Value::String(msg_type.to_string()));
        for (key, value) in fields {
            if key != TYPE_FIELD {
                record.insert(key.clone(), value.clone());
            }
        }

        let mut bytes = serde_json::to_vec(&record)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn deserialize(&self, line: &[u8]) -> Result<Fields, ProtocolError> {
        match serde_json::from_slice::<Value>(line)? {
            Value::Object(fields) => Ok(fields),
            other => Err(ProtocolError::NotAnObject(json_kind(&other))),
        }
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

// ── Typed payload helpers ─────────────────────────────────────────────────────

/// Converts a typed payload into a field map.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadNotAnObject`] when `payload` serializes
/// to anything other than a JSON object.
pub fn to_fields<T: Serialize>(payload: &T) -> Result<Fields, ProtocolError> {
    match serde_json::to_value(payload)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(ProtocolError::PayloadNotAnObject),
    }
}

/// Reads a typed payload out of a received field map.
///
/// Unknown keys (including `type` and `origin`) are ignored; missing keys
/// fall back to the payload's serde defaults.
pub fn from_fields<T: DeserializeOwned>(fields: &Fields) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(fields.clone()))
}

/// Returns the record's `type` when it is present and a string.
pub fn message_type(fields: &Fields) -> Option<&str> {
    fields.get(TYPE_FIELD).and_then(Value::as_str)
}
