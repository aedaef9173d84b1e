use serde::Serialize;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 digest of the given data and returns it as a hex string.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serializes `value` as canonical JSON: object keys sorted, no whitespace.
///
/// Going through `serde_json::Value` first sorts keys at every depth (the map
/// is a `BTreeMap` as long as serde_json's `preserve_order` feature stays off),
/// so struct field order and `HashMap` iteration order never leak into the bytes.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// Hex SHA-256 of an already-built JSON value.
///
/// `Value`'s `Display` is compact JSON and its maps are sorted, so this is
/// the infallible path for data that is JSON to begin with.
pub fn digest_value(value: &serde_json::Value) -> String {
    digest(value.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_digest() {
        let hash = digest(b"hello world");
        assert_eq!(hash, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let bytes = canonical_json(&json!({"b": 1, "a": {"d": true, "c": null}})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":{"c":null,"d":true},"b":1}"#);
    }

    #[test]
    fn test_digest_value_matches_canonical_bytes() {
        let value = json!({"replicas": 3, "action": "scale_db_pool"});
        assert_eq!(digest_value(&value), digest(&canonical_json(&value).unwrap()));
    }

    #[test]
    fn test_canonical_json_ignores_insertion_order() {
        let mut first = HashMap::new();
        first.insert("zeta", 1);
        first.insert("alpha", 2);

        let mut second = HashMap::new();
        second.insert("alpha", 2);
        second.insert("zeta", 1);

        assert_eq!(canonical_json(&first).unwrap(), canonical_json(&second).unwrap());
    }
}
