/// Core abstractions shared by the directory, the pool and the router
pub mod ack;
pub mod connection;
pub mod pool;
pub mod session;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A routed document
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field used as shard key when a collection does not name one
pub const DEFAULT_SHARD_KEY: &str = "_id";

/// Identity of a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Represents a shard endpoint as published by the metadata store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub endpoint: String,
}

impl ShardInfo {
    pub fn new<S: Into<String>>(id: ShardId, endpoint: S) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

/// One end of a key range. `MinKey` sorts before every value and `MaxKey` after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBound {
    MinKey,
    Value(i64),
    MaxKey,
}

impl fmt::Display for KeyBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyBound::MinKey => write!(f, "MinKey"),
            KeyBound::Value(v) => write!(f, "{}", v),
            KeyBound::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// Half-open key interval `[min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: KeyBound,
    pub max: KeyBound,
}

impl KeyRange {
    pub fn new(min: KeyBound, max: KeyBound) -> Self {
        Self { min, max }
    }

    /// The range covering every key
    pub fn full() -> Self {
        Self::new(KeyBound::MinKey, KeyBound::MaxKey)
    }

    pub fn contains(&self, key: i64) -> bool {
        let key = KeyBound::Value(key);
        self.min <= key && key < self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// Whether two half-open ranges share at least one key
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Read predicate evaluated against the collection's shard key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    All,
    KeyEq { key: i64 },
    KeyRange { range: KeyRange },
    FieldEq { field: String, value: serde_json::Value },
}

impl Filter {
    /// Key range this filter can be targeted with
    pub fn target_range(&self) -> KeyRange {
        match self {
            Filter::KeyEq { key } => KeyRange::new(
                KeyBound::Value(*key),
                key.checked_add(1).map_or(KeyBound::MaxKey, KeyBound::Value),
            ),
            Filter::KeyRange { range } => *range,
            Filter::All | Filter::FieldEq { .. } => KeyRange::full(),
        }
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, key_field: &str, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::KeyEq { key } => shard_key_of(key_field, document) == Some(*key),
            Filter::KeyRange { range } => {
                shard_key_of(key_field, document).map_or(false, |k| range.contains(k))
            }
            Filter::FieldEq { field, value } => document.get(field) == Some(value),
        }
    }
}

/// Extract an integer shard key from a document
pub fn shard_key_of(key_field: &str, document: &Document) -> Option<i64> {
    document.get(key_field).and_then(|v| v.as_i64())
}

/// Order documents by shard key; documents without a key sort last
pub fn compare_by_key(key_field: &str, a: &Document, b: &Document) -> Ordering {
    match (shard_key_of(key_field, a), shard_key_of(key_field, b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Split `"db.collection"` into its database and collection parts
pub fn split_namespace(namespace: &str) -> Option<(&str, &str)> {
    let (db, coll) = namespace.split_once('.')?;
    if db.is_empty() || coll.is_empty() {
        return None;
    }
    Some((db, coll))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_key_bound_ordering() {
        assert!(KeyBound::MinKey < KeyBound::Value(i64::MIN));
        assert!(KeyBound::Value(i64::MAX) < KeyBound::MaxKey);
        assert!(KeyBound::Value(-1) < KeyBound::Value(0));
    }

    #[test]
    fn test_key_range_contains() {
        let range = KeyRange::new(KeyBound::MinKey, KeyBound::Value(0));
        assert!(range.contains(-1));
        assert!(range.contains(i64::MIN));
        assert!(!range.contains(0));

        let upper = KeyRange::new(KeyBound::Value(0), KeyBound::MaxKey);
        assert!(upper.contains(0));
        assert!(upper.contains(i64::MAX));
        assert!(!range.overlaps(&upper));
        assert!(KeyRange::full().overlaps(&upper));
    }

    #[test]
    fn test_filter_targeting() {
        let point = Filter::KeyEq { key: 5 };
        assert_eq!(
            point.target_range(),
            KeyRange::new(KeyBound::Value(5), KeyBound::Value(6))
        );

        let max = Filter::KeyEq { key: i64::MAX };
        assert_eq!(max.target_range().max, KeyBound::MaxKey);

        let untargeted = Filter::FieldEq {
            field: "name".to_string(),
            value: json!("x"),
        };
        assert_eq!(untargeted.target_range(), KeyRange::full());
    }

    #[test]
    fn test_filter_matches() {
        let d = doc(json!({"_id": 3, "name": "x"}));
        assert!(Filter::All.matches("_id", &d));
        assert!(Filter::KeyEq { key: 3 }.matches("_id", &d));
        assert!(!Filter::KeyEq { key: 4 }.matches("_id", &d));
        assert!(Filter::FieldEq {
            field: "name".to_string(),
            value: json!("x")
        }
        .matches("_id", &d));
        assert!(!Filter::KeyEq { key: 3 }.matches("other", &d));
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("foo.bar"), Some(("foo", "bar")));
        assert_eq!(split_namespace("foo.bar.baz"), Some(("foo", "bar.baz")));
        assert_eq!(split_namespace("foo"), None);
        assert_eq!(split_namespace(".bar"), None);
    }
}
