//! Content hashing for change and drift detection.
//!
//! Hashes are SHA-256 over canonical JSON: object keys sorted, no
//! whitespace. Two attribute maps with the same content always hash the same,
//! regardless of how they were built.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::DeployConfig;
use crate::model::Attributes;

/// Hasher for configuration and attribute content.
#[derive(Debug, Default)]
pub struct ContentHasher;

impl ContentHasher {
    /// Hashes a recorded attribute map.
    #[must_use]
    pub fn hash_attributes(attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"{");
        for (i, (key, value)) in attributes.iter().enumerate() {
            if i > 0 {
                hasher.update(b",");
            }
            hasher.update(Value::String(key.clone()).to_string().as_bytes());
            hasher.update(b":");
            hasher.update(canonical_json(value).as_bytes());
        }
        hasher.update(b"}");
        hex::encode(hasher.finalize())
    }

    /// Hashes any serializable value through its canonical JSON form.
    ///
    /// Values that fail to serialize hash as `null`.
    #[must_use]
    pub fn hash_value<T: Serialize>(value: &T) -> String {
        let json = serde_json::to_value(value).unwrap_or(Value::Null);
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&json).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Hashes the whole configuration document.
    ///
    /// The hash changes when any declaration, variable or setting changes.
    #[must_use]
    pub fn hash_config(config: &DeployConfig) -> String {
        Self::hash_value(config)
    }

    /// Returns the first 12 characters of a hash for display.
    #[must_use]
    pub fn short(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}

/// Renders a value as canonical JSON with sorted object keys.
#[must_use]
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
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_hash_deterministic() {
        let a = attrs(json!({"cidr": "10.0.0.0/16", "tags": {"b": 1, "a": 2}}));
        let b = attrs(json!({"tags": {"a": 2, "b": 1}, "cidr": "10.0.0.0/16"}));
        assert_eq!(ContentHasher::hash_attributes(&a), ContentHasher::hash_attributes(&b));
        assert_eq!(ContentHasher::hash_attributes(&a).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = attrs(json!({"cidr": "10.0.0.0/16"}));
        let b = attrs(json!({"cidr": "10.1.0.0/16"}));
        assert_ne!(ContentHasher::hash_attributes(&a), ContentHasher::hash_attributes(&b));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = json!({"z": [1, {"y": true, "x": null}], "a": "s"});
        assert_eq!(canonical_json(&value), r#"{"a":"s","z":[1,{"x":null,"y":true}]}"#);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ContentHasher::short("0123456789abcdef"), "0123456789ab");
        assert_eq!(ContentHasher::short("abc"), "abc");
    }
}
