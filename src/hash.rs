//! Canonical JSON hashing.
//!
//! `hash_json_canonical` reorders every JSON object's keys lexicographically,
//! strips insignificant whitespace, and hashes the resulting compact encoding.
//! This is the function spec §4.4 step 4 requires both merchant- and
//! wallet-side, so that a contract's `h_proposal` is reproducible regardless
//! of field insertion order.

use eyre::{eyre, Result};
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;

use crate::types::HashCode;

/// Recursively rewrite a `Value` so every object is a `BTreeMap`-backed,
/// lexicographically-key-ordered object. Arrays keep their element order;
/// only object key order is normalized.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Serialize `value` in canonical form (sorted keys, compact, no whitespace).
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>> {
    let canonical = canonicalize(value);
    serde_json::to_vec(&canonical).map_err(|e| eyre!("failed to serialize canonical JSON: {e}"))
}

/// Hash a JSON value with the canonicalization rule above.
pub fn hash_json_canonical(value: &Value) -> Result<HashCode> {
    let bytes = canonical_json_bytes(value)?;
    Ok(hash_bytes(&bytes))
}

/// Hash raw bytes (used for `h_wire`, `h_transaction_id`, session hashes).
pub fn hash_bytes(bytes: &[u8]) -> HashCode {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest[..32]);
    HashCode(out)
}

/// Hash a UTF-8 string (used for hashing transaction-id strings and
/// wire-method names before they become map keys, per spec §4.1/§4.4).
pub fn hash_str(s: &str) -> HashCode {
    hash_bytes(s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_hash_is_order_independent() {
        let a = json!({"b": 1, "a": 2, "c": {"y": 1, "x": 2}});
        let b = json!({"a": 2, "c": {"x": 2, "y": 1}, "b": 1});
        assert_eq!(hash_json_canonical(&a).unwrap(), hash_json_canonical(&b).unwrap());
    }

    #[test]
    fn canonical_hash_differs_on_value_change() {
        let a = json!({"amount": "CUR:1.0"});
        let b = json!({"amount": "CUR:2.0"});
        assert_ne!(hash_json_canonical(&a).unwrap(), hash_json_canonical(&b).unwrap());
    }

    #[test]
    fn canonical_bytes_have_no_insignificant_whitespace() {
        let v = json!({"a": 1});
        let bytes = canonical_json_bytes(&v).unwrap();
        assert_eq!(bytes, b"{\"a\":1}");
    }

    #[test]
    fn hash_str_matches_hash_bytes() {
        assert_eq!(hash_str("order-1"), hash_bytes(b"order-1"));
    }
}
