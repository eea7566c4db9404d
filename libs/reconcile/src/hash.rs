//! Deterministic fingerprints of JSON documents.

use sha2::{Digest, Sha256};

/// Hash of a JSON document's canonical form.
///
/// Object key order does not affect the result, so two equal documents
/// built in different orders produce the same hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        write_canonical(json, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sorted keys, no whitespace. Strings use serde_json's own escaping.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
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

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let a = serde_json::json!({"job": {"name": "director", "templates": []}, "index": 0});
        let b = serde_json::json!({"index": 0, "job": {"templates": [], "name": "director"}});

        assert_eq!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }

    #[test]
    fn test_spec_hash_sensitive_to_values() {
        let a = serde_json::json!({"packages": ["ruby", "nginx"]});
        let b = serde_json::json!({"packages": ["nginx", "ruby"]});

        assert_ne!(SpecHash::from_json(&a), SpecHash::from_json(&b));
    }

    #[test]
    fn test_spec_hash_is_hex_sha256() {
        let hash = SpecHash::from_json(&serde_json::json!(null));
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
