// crates/fsm-storage-core/src/core/data.rs
// ============================================================================
// Module: FSM Data Mappings
// Description: JSON object mappings stored as data and bucket records.
// Purpose: Define the mapping type and its shallow merge law.
// Dependencies: serde_json
// ============================================================================

//! ## Overview
//! Data and bucket records are JSON objects. Backends persist them as JSON
//! text and must reject anything that does not decode to an object, since
//! the host only ever writes objects.

use serde_json::Map;
use serde_json::Value;

use crate::interfaces::StorageError;

/// Mapping of string keys to JSON values held in data and bucket records.
pub type DataMap = Map<String, Value>;

/// Shallow-merges `patch` into `target`.
///
/// Every top-level key in `patch` overwrites the same key in `target`.
/// Nested objects are replaced wholesale and `null` is stored as a value,
/// not treated as a deletion.
pub fn merge_data(target: &mut DataMap, patch: &DataMap) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Decodes a persisted JSON payload into a mapping.
///
/// # Errors
///
/// Returns [`StorageError::Corrupt`] when the payload is not valid JSON or is
/// not a JSON object.
pub fn parse_data_map(payload: &str) -> Result<DataMap, StorageError> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|err| StorageError::Corrupt(format!("stored mapping is not json: {err}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::Corrupt(format!(
            "stored mapping is not a json object (found {})",
            json_kind(&other)
        ))),
    }
}

/// Returns a short label for a JSON value kind.
const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
