use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StoreError, StoreResult};

/// Access mode requested when a transaction begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("readonly"),
            Self::ReadWrite => f.write_str("readwrite"),
        }
    }
}

/// A secondary index: records are ordered by the value at `key_path`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub key_path: String,
}

/// Table definition: the primary key path plus any secondary indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Top-level field holding the record's string primary key.
    pub key_path: String,
    pub indexes: Vec<IndexSchema>,
}

impl TableSchema {
    /// Create a table definition with no secondary indexes.
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            indexes: Vec::new(),
        }
    }

    /// Add a secondary index (builder style).
    pub fn with_index(mut self, name: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.indexes.push(IndexSchema {
            name: name.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|idx| idx.name == name)
    }

    /// Extract the primary key from a record.
    pub fn primary_key(&self, record: &Value) -> StoreResult<String> {
        match record.get(&self.key_path) {
            Some(Value::String(key)) => Ok(key.clone()),
            _ => Err(StoreError::MissingKey {
                table: self.name.clone(),
                key_path: self.key_path.clone(),
            }),
        }
    }
}

/// An orderable index value. Numbers sort before strings.
///
/// Records whose indexed field is absent or of another JSON kind are not
/// reachable through that index.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexKey {
    Number(f64),
    Text(String),
}

impl IndexKey {
    /// Extract the index key at `key_path`, if the record has a usable one.
    pub fn extract(record: &Value, key_path: &str) -> Option<Self> {
        match record.get(key_path)? {
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.total_cmp(b),
            (Self::Number(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Number(_)) => Ordering::Greater,
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primary_key_extraction() {
        let schema = TableSchema::new("entries", "key");
        assert_eq!(schema.primary_key(&json!({"key": "a"})).unwrap(), "a");
        assert!(matches!(
            schema.primary_key(&json!({"key": 7})),
            Err(StoreError::MissingKey { .. })
        ));
        assert!(schema.primary_key(&json!({"other": "a"})).is_err());
    }

    #[test]
    fn index_lookup() {
        let schema = TableSchema::new("entries", "key").with_index("expires", "expires");
        assert_eq!(schema.index("expires").unwrap().key_path, "expires");
        assert!(schema.index("missing").is_none());
    }

    #[test]
    fn index_key_ordering() {
        let mut keys = vec![
            IndexKey::Text("b".into()),
            IndexKey::Number(10.0),
            IndexKey::Text("a".into()),
            IndexKey::Number(-1.5),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                IndexKey::Number(-1.5),
                IndexKey::Number(10.0),
                IndexKey::Text("a".into()),
                IndexKey::Text("b".into()),
            ]
        );
    }

    #[test]
    fn index_key_ignores_unusable_fields() {
        assert_eq!(IndexKey::extract(&json!({"e": 5}), "e"), Some(IndexKey::Number(5.0)));
        assert_eq!(IndexKey::extract(&json!({"e": null}), "e"), None);
        assert_eq!(IndexKey::extract(&json!({"e": [1]}), "e"), None);
        assert_eq!(IndexKey::extract(&json!({}), "e"), None);
    }

    #[test]
    fn mode_display() {
        assert_eq!(TxMode::ReadOnly.to_string(), "readonly");
        assert_eq!(TxMode::ReadWrite.to_string(), "readwrite");
    }
}
