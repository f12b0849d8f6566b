//! Cache-key computation.
//!
//! Keys are SHA-256 over a canonical byte encoding of the element's resolved
//! build inputs. The encoding is unambiguous (strings are length-prefixed,
//! every value carries a type tag) and independent of mapping key order, so
//! keys are stable across machines, runs and YAML reformatting.

use serde_json::Value;
use sha2::{Digest as _, Sha256};

/// Appends the canonical encoding of `value` to `out`.
///
/// Objects are emitted with keys in lexicographic order; arrays preserve
/// their declared order; scalars are tagged and strings length-prefixed.
pub fn canonical_bytes(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'z'),
        Value::Bool(b) => {
            out.extend_from_slice(if *b { b"b:true" } else { b"b:false" });
        }
        Value::Number(n) => {
            out.extend_from_slice(b"n:");
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => encode_str(s, out),
        Value::Array(items) => {
            out.extend_from_slice(b"l[");
            for item in items {
                canonical_bytes(item, out);
                out.push(b',');
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.extend_from_slice(b"m{");
            for key in keys {
                encode_str(key, out);
                out.push(b'=');
                canonical_bytes(&map[key], out);
                out.push(b',');
            }
            out.push(b'}');
        }
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(b"s:");
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s.as_bytes());
}

/// Hex SHA-256 of the canonical encoding.
pub fn hash_value(value: &Value) -> String {
    let mut bytes = Vec::with_capacity(256);
    canonical_bytes(value, &mut bytes);
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// The dependency-independent portion of an element's key.
#[allow(clippy::too_many_arguments)]
pub fn element_unique(
    kind: &str,
    plugin_version: u32,
    config: Value,
    variables: Value,
    environment: Value,
    sources: Vec<Value>,
    public: Value,
    sandbox: Value,
) -> Value {
    serde_json::json!({
        "kind": kind,
        "plugin-version": plugin_version,
        "config": config,
        "variables": variables,
        "environment": environment,
        "sources": sources,
        "public": public,
        "sandbox": sandbox,
    })
}

/// Weak key: dependencies contribute their names only.
pub fn weak_key(unique: &Value, dependency_names: &[String]) -> String {
    hash_value(&serde_json::json!({
        "unique": unique,
        "dependencies": dependency_names,
    }))
}

/// Strong key: dependencies contribute their own strong keys.
pub fn strong_key(unique: &Value, dependency_keys: &[String]) -> String {
    hash_value(&serde_json::json!({
        "unique": unique,
        "dependencies": dependency_keys,
    }))
}
