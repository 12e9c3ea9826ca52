//! Canonical JSON encoding.
//!
//! Object keys are emitted in byte order with no insignificant whitespace, so
//! two semantically equal documents always produce the same bytes regardless
//! of how their maps were built or which serde_json features are enabled.

use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use serde_json::Value;

/// Serialize any value to canonical JSON bytes
///
/// # Errors
///
/// Returns a parse error if the value cannot be represented as JSON
/// (for example a map with non-string keys)
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> CoreResult<Vec<u8>> {
    Ok(to_canonical_string(value)?.into_bytes())
}

/// Serialize any value to a canonical JSON string
///
/// # Errors
///
/// See [`to_canonical_bytes`]
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> CoreResult<String> {
    let value = serde_json::to_value(value).map_err(|e| CoreError::Parse {
        message: e.to_string(),
    })?;
    Ok(canonical_value(&value))
}

/// Canonical JSON text of a JSON value
///
/// Every `Value` is representable, so this cannot fail.
#[must_use]
pub fn canonical_value(value: &Value) -> String {
    let mut out = String::with_capacity(64);
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                write_value(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        // Display on a scalar is its compact JSON form
        scalar => out.push_str(&scalar.to_string()),
    }
}
