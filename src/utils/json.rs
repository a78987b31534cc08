// Canonical-JSON helpers used for stable hashing/signatures (tool event
// dedup signatures, replication op payload snapshots).

use serde_json::Value;
use std::collections::BTreeMap;

/// Re-serialize a JSON value with object keys sorted, so two semantically
/// equal values with different key orders hash and compare identically.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical-JSON string form of a value, for hashing/dedup signatures.
pub fn canonical_string(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Parse a JSON object from a string, defaulting to an empty object on
/// malformed or non-object input rather than failing the caller — used for
/// permissive metadata columns where a corrupt blob should degrade, not crash.
pub fn parse_object_or_empty(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => v,
        _ => Value::Object(serde_json::Map::new()),
    }
}
