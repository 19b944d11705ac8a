//! Key tuples and the deterministic cache-key codec.
//!
//! A record is identified by an ordered list of key-column values. The codec
//! turns that list into one string so it can be used as a cache key, and
//! splits it back apart. Parts keep their order; the delimiter and the escape
//! character are escaped inside parts so any value survives the round trip.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Separator between encoded key parts.
pub const KEY_DELIMITER: char = '|';

/// Escape character for delimiters occurring inside a part.
const ESCAPE: char = '\\';

/// Ordered key-column values identifying one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyTuple(Vec<Value>);

impl KeyTuple {
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// Single-column key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    /// Key made only of string parts.
    pub fn from_strs<S: AsRef<str>>(parts: &[S]) -> Self {
        Self(
            parts
                .iter()
                .map(|p| Value::String(p.as_ref().to_string()))
                .collect(),
        )
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first `len` parts (the whole tuple if it is shorter).
    pub fn prefix(&self, len: usize) -> KeyTuple {
        KeyTuple(self.0.iter().take(len).cloned().collect())
    }

    /// Canonical string form of every part, as used for matching.
    pub fn canonical_parts(&self) -> Vec<String> {
        self.0.iter().map(canonical_part).collect()
    }

    /// Encoded form without any namespace.
    pub fn encode(&self) -> String {
        encode_parts(&self.canonical_parts())
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl From<&str> for KeyTuple {
    fn from(value: &str) -> Self {
        KeyTuple::single(value)
    }
}

impl From<String> for KeyTuple {
    fn from(value: String) -> Self {
        KeyTuple::single(value)
    }
}

/// Canonical string for one key value.
///
/// Strings are taken verbatim, numbers and booleans use their JSON spelling,
/// null becomes the empty string.
pub fn canonical_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Join parts with the delimiter, escaping as needed.
pub fn encode_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(KEY_DELIMITER);
        }
        for c in part.as_ref().chars() {
            if c == KEY_DELIMITER || c == ESCAPE {
                out.push(ESCAPE);
            }
            out.push(c);
        }
    }
    out
}

/// Split an encoded key back into its parts.
///
/// Returns `None` for a dangling escape at the end of the input.
pub fn decode_parts(encoded: &str) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            current.push(chars.next()?);
        } else if c == KEY_DELIMITER {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    Some(parts)
}

/// Full cache key: `<namespace><encoded-key>`.
pub fn cache_key(namespace: &str, key: &KeyTuple) -> String {
    format!("{}{}", namespace, key.encode())
}

/// Inverse of [`cache_key`]. `None` if the key is outside the namespace.
pub fn decode_cache_key(namespace: &str, cache_key: &str) -> Option<Vec<String>> {
    cache_key.strip_prefix(namespace).and_then(decode_parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_simple_tuple() {
        let key = KeyTuple::new(vec![json!("blocklist"), json!("10.0"), json!(0), json!(255)]);
        assert_eq!(key.encode(), "blocklist|10.0|0|255");
    }

    #[test]
    fn test_encode_escapes_delimiter() {
        let key = KeyTuple::from_strs(&["a|b", "c\\d"]);
        let encoded = key.encode();
        assert_eq!(encoded, "a\\|b|c\\\\d");
        assert_eq!(
            decode_parts(&encoded).unwrap(),
            vec!["a|b".to_string(), "c\\d".to_string()]
        );
    }

    #[test]
    fn test_order_is_preserved() {
        let ab = KeyTuple::from_strs(&["a", "b"]);
        let ba = KeyTuple::from_strs(&["b", "a"]);
        assert_ne!(ab.encode(), ba.encode());
    }

    #[test]
    fn test_cache_key_namespace() {
        let key = KeyTuple::single("tok-1");
        let full = cache_key("tokens:", &key);
        assert_eq!(full, "tokens:tok-1");
        assert_eq!(
            decode_cache_key("tokens:", &full).unwrap(),
            vec!["tok-1".to_string()]
        );
        assert!(decode_cache_key("rules:", &full).is_none());
    }

    #[test]
    fn test_dangling_escape_rejected() {
        assert!(decode_parts("abc\\").is_none());
    }

    #[test]
    fn test_prefix() {
        let key = KeyTuple::from_strs(&["a", "b", "c"]);
        assert_eq!(key.prefix(2), KeyTuple::from_strs(&["a", "b"]));
        assert_eq!(key.prefix(10), key);
    }

    #[test]
    fn test_canonical_part_numbers() {
        assert_eq!(canonical_part(&json!(42)), "42");
        assert_eq!(canonical_part(&json!(true)), "true");
        assert_eq!(canonical_part(&Value::Null), "");
    }
}
