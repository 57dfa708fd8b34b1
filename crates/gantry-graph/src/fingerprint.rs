//! Deterministic configuration fingerprints for the build cache.
//!
//! Only semantically relevant fields participate: two configurations that
//! differ in field order, null-vs-absent values, or request-scoped fields
//! (thread/run/assistant ids, bearer tokens) hash identically.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

use gantry_core::ids::GraphId;

/// Allow-list of configuration fields that affect the compiled graph.
/// Request-scoped fields are excluded by construction: anything not listed
/// here never reaches the hash.
const SEMANTIC_FIELDS: &[&str] = &[
    "model",
    "temperature",
    "max_tokens",
    "system_prompt",
    "tools",
    "tool_choice",
    "retriever",
    "rag",
    "endpoint",
    "base_url",
];

/// Compute the cache fingerprint for (graph id, config).
pub fn fingerprint(graph_id: &GraphId, config: &Value) -> String {
    let mut canonical: BTreeMap<&str, Value> = BTreeMap::new();

    if let Some(obj) = config.as_object() {
        for field in SEMANTIC_FIELDS {
            match obj.get(*field) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    canonical.insert(field, normalize(value));
                }
            }
        }
    }

    let payload = serde_json::to_string(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(graph_id.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Normalize a value: drop null object entries recursively so that absent
/// and null nested fields hash the same. serde_json's map is ordered, so
/// serialization is already key-sorted.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(obj) => Value::Object(
            obj.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph() -> GraphId {
        GraphId::new("agent")
    }

    #[test]
    fn field_order_is_irrelevant() {
        let a = json!({"model": "m1", "temperature": 0.5});
        let b = json!({"temperature": 0.5, "model": "m1"});
        assert_eq!(fingerprint(&graph(), &a), fingerprint(&graph(), &b));
    }

    #[test]
    fn null_equals_absent() {
        let a = json!({"model": "m1", "system_prompt": null});
        let b = json!({"model": "m1"});
        assert_eq!(fingerprint(&graph(), &a), fingerprint(&graph(), &b));
    }

    #[test]
    fn nested_null_equals_absent() {
        let a = json!({"model": "m1", "tools": {"search": {"top_k": 5, "filter": null}}});
        let b = json!({"model": "m1", "tools": {"search": {"top_k": 5}}});
        assert_eq!(fingerprint(&graph(), &a), fingerprint(&graph(), &b));
    }

    #[test]
    fn request_scoped_fields_are_excluded() {
        let a = json!({"model": "m1", "thread_id": "thread_1", "run_id": "run_9", "bearer_token": "secret"});
        let b = json!({"model": "m1", "thread_id": "thread_2"});
        assert_eq!(fingerprint(&graph(), &a), fingerprint(&graph(), &b));
    }

    #[test]
    fn semantic_change_alters_fingerprint() {
        let a = json!({"model": "m1"});
        let b = json!({"model": "m2"});
        assert_ne!(fingerprint(&graph(), &a), fingerprint(&graph(), &b));

        let c = json!({"model": "m1", "temperature": 0.1});
        assert_ne!(fingerprint(&graph(), &a), fingerprint(&graph(), &c));
    }

    #[test]
    fn graph_id_participates() {
        let config = json!({"model": "m1"});
        assert_ne!(
            fingerprint(&GraphId::new("agent-a"), &config),
            fingerprint(&GraphId::new("agent-b"), &config)
        );
    }

    #[test]
    fn non_object_config_hashes_like_empty() {
        assert_eq!(
            fingerprint(&graph(), &Value::Null),
            fingerprint(&graph(), &json!({}))
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(&graph(), &json!({"model": "m1"}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
