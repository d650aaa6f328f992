//! Flat, ordered key/value record carried by every wire message.

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// A key that falls outside `[A-Za-z0-9._-]` or is empty
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid frame key: {0:?}")]
pub struct InvalidKey(pub String);

/// Check a key against the allowed alphabet
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Ordered mapping of ASCII keys to Unicode string values.
///
/// Keys are unique. Insertion order is preserved and is the order used on
/// the wire. Frames are small (a handful of fields), so lookups are linear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    entries: Vec<(String, String)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a frame from `(key, value)` pairs, failing on the first bad key
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, InvalidKey>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut frame = Self::new();
        for (key, value) in pairs {
            frame.insert(key, value)?;
        }
        Ok(frame)
    }

    /// Insert or replace a field.
    ///
    /// Replacing keeps the original position. Returns the previous value.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Option<String>, InvalidKey> {
        let key = key.into();
        if !is_valid_key(&key) {
            return Err(InvalidKey(key));
        }
        let value = value.into();

        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            return Ok(Some(std::mem::replace(&mut slot.1, value)));
        }
        self.entries.push((key, value));
        Ok(None)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a pair whose key has already been validated and checked for
    /// duplicates by the caller.
    pub(crate) fn push_unchecked(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }
}

impl IntoIterator for Frame {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_alphabet() {
        assert!(is_valid_key("arm_grab"));
        assert!(is_valid_key("pos.x-1"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("has space"));
        assert!(!is_valid_key("ümlaut"));
        assert!(!is_valid_key("a=b"));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut frame = Frame::from_pairs([("a", "1"), ("b", "2"), ("c", "3")]).unwrap();
        let previous = frame.insert("b", "two").unwrap();

        assert_eq!(previous.as_deref(), Some("2"));
        assert_eq!(frame.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(frame.get("b"), Some("two"));
    }

    #[test]
    fn test_insert_rejects_bad_key() {
        let mut frame = Frame::new();
        let err = frame.insert("bad key", "x").unwrap_err();
        assert_eq!(err, InvalidKey("bad key".to_string()));
        assert!(frame.is_empty());
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let frame = Frame::from_pairs([("Text", "upper"), ("text", "lower")]).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.get("Text"), Some("upper"));
        assert_eq!(frame.get("text"), Some("lower"));
    }

    #[test]
    fn test_remove() {
        let mut frame = Frame::from_pairs([("a", "1"), ("b", "2")]).unwrap();
        assert_eq!(frame.remove("a").as_deref(), Some("1"));
        assert_eq!(frame.remove("a"), None);
        assert_eq!(frame.len(), 1);
    }

    #[test]
    fn test_serializes_as_ordered_object() {
        let frame = Frame::from_pairs([("z", "last?"), ("a", "no, first")]).unwrap();
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"z":"last?","a":"no, first"}"#);
    }
}
