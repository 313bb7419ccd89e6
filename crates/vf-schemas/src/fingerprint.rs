//! Canonical-JSON fingerprints.
//!
//! Used for submission-time operation lookup (same asset + type + params)
//! and for derivative ETags. Object keys are sorted recursively so the
//! hash is independent of serialization order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON encoding of `v`, hex-encoded.
pub fn params_fingerprint(v: &Value) -> String {
    let canonical = canonicalize_json(v);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = json!({"width": 1280, "height": 720, "type": "resize"});
        let b = json!({"type": "resize", "height": 720, "width": 1280});
        assert_eq!(params_fingerprint(&a), params_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = json!({"type": "resize", "width": 1280, "height": 720});
        let b = json!({"type": "resize", "width": 1280, "height": 721});
        assert_ne!(params_fingerprint(&a), params_fingerprint(&b));
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let v = json!({"b": [ {"z": 1, "a": 2} ], "a": 1});
        assert_eq!(canonicalize_json(&v), r#"{"a":1,"b":[{"a":2,"z":1}]}"#);
    }
}
