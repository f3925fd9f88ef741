//! Binary buffers inside opaque payloads.
//!
//! JSON has no byte-string type, so buffers travel as a tagged object
//! `{"$bytes": "<base64>"}` and are decoded back on arrival.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};

use crate::types::{Error, Result};

/// Tag key marking an encoded buffer.
pub const BYTES_TAG: &str = "$bytes";

/// Wrap a byte buffer into a transmissible value.
pub fn encode_bytes(bytes: &[u8]) -> Value {
    let mut obj = Map::new();
    obj.insert(BYTES_TAG.to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(obj)
}

/// True if `value` is a tagged buffer.
pub fn is_bytes(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.len() == 1 && obj.get(BYTES_TAG).map_or(false, Value::is_string))
        .unwrap_or(false)
}

/// Unwrap a tagged buffer.
pub fn decode_bytes(value: &Value) -> Result<Vec<u8>> {
    let encoded = value
        .get(BYTES_TAG)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Serialization(format!("expected a {} object", BYTES_TAG)))?;
    STANDARD
        .decode(encoded)
        .map_err(|e| Error::Serialization(format!("invalid base64 payload: {}", e)))
}
