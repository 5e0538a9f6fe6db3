//! Canonical JSON serialization for content-addressed snapshots.
//!
//! Snapshot IDs are sha256 digests over a canonical encoding, so the same
//! structural content always hashes to the same ID regardless of field
//! ordering in the source value.
//!
//! Canonical JSON here means:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No insignificant whitespace
//! - UTF-8 output

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns a `Serialization` error if the value cannot be represented as JSON.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let v = serde_json::to_value(value)
        .map_err(|e| Error::serialization(format!("canonical encoding failed: {e}")))?;
    let mut out = Vec::new();
    write_value(&v, &mut out);
    Ok(out)
}

/// Computes the sha256 hex digest of `value`'s canonical JSON encoding.
///
/// # Errors
///
/// Returns a `Serialization` error if the value cannot be represented as JSON.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let bytes = to_canonical_bytes(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out);
                out.push(b':');
                write_value(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // serde_json escapes strings deterministically.
    out.extend_from_slice(
        serde_json::to_string(s)
            .unwrap_or_else(|_| String::from("\"\""))
            .as_bytes(),
    );
}
