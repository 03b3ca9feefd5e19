//! Content fingerprints for job inputs
//!
//! Inputs are serialized with RFC 8785 (JCS) so that key order and number
//! formatting never change the digest, then hashed with SHA-256.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex SHA-256 over the canonical JSON form of `value`
pub fn fingerprint(value: &serde_json::Value) -> String {
    // JCS only rejects non-finite numbers and non-string keys, neither of
    // which a `Value` can hold, so the fallback is unreachable
    let bytes = serde_jcs::to_vec(value).unwrap_or_else(|_| value.to_string().into_bytes());
    hex::encode(Sha256::digest(&bytes))
}

/// Fingerprint any serializable input
pub fn fingerprint_of<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(fingerprint(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"model":"m1","text":"hello","opts":{"x":1,"y":[1,2]}}"#)
                .unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"opts":{"y":[1,2],"x":1},"text":"hello","model":"m1"}"#)
                .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_distinct_inputs_differ() {
        assert_ne!(
            fingerprint(&json!({"text": "a"})),
            fingerprint(&json!({"text": "b"}))
        );
        assert_ne!(fingerprint(&json!([1, 2])), fingerprint(&json!([2, 1])));
        assert_ne!(fingerprint(&json!("1")), fingerprint(&json!(1)));
    }

    #[test]
    fn test_digest_is_sha256_of_canonical_json() {
        // canonical form: {"a":1.5,"b":[1,"x"]}
        let value = json!({"b": [1, "x"], "a": 1.5});
        assert_eq!(
            fingerprint(&value),
            "26b8f4c6a22f8c2ff8414135079d6506f60236f231b504c1f7c3ba8876674bc2"
        );
    }

    #[test]
    fn test_digest_shape() {
        let fp = fingerprint(&json!({"text": "a"}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&json!({"text": "a"})));
    }

    #[test]
    fn test_typed_input_matches_value() {
        #[derive(Serialize)]
        struct Input {
            text: String,
            top_k: u32,
        }

        let typed = fingerprint_of(&Input {
            text: "a".into(),
            top_k: 3,
        })
        .unwrap();
        assert_eq!(typed, fingerprint(&json!({"top_k": 3, "text": "a"})));
    }
}
