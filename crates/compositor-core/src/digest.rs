//! Stable content digests
//!
//! Digests are SHA-256 over a canonical JSON encoding in which object keys are
//! sorted recursively, so two values that differ only in map ordering produce
//! the same digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Canonical JSON text with recursively sorted object keys
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 of raw bytes, hex encoded
pub fn digest_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value, independent of key order
pub fn digest_value(value: &Value) -> String {
    digest_bytes(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"b": 1, "a": {"d": [3, {"z": 1, "y": 2}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"d":[3,{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": "two"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": "two", "x": 1}"#).unwrap();
        assert_eq!(digest_value(&a), digest_value(&b));
        assert_eq!(digest_value(&a).len(), 64);
    }

    #[test]
    fn test_digest_respects_array_order() {
        assert_ne!(digest_value(&json!([1, 2])), digest_value(&json!([2, 1])));
    }

    #[test]
    fn test_digest_escapes_keys() {
        let tricky = json!({"a\"b": 1});
        assert_eq!(canonical_json(&tricky), r#"{"a\"b":1}"#);
    }
}
