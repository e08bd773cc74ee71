use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stash_store::TableSchema;
use stash_types::Timestamp;

use crate::error::AdapterResult;

/// Table holding cache entries.
pub const ENTRIES_TABLE: &str = "entries";
/// Secondary index over entry expiration.
pub const EXPIRES_INDEX: &str = "expires";

/// Schema of the entries table: keyed by `key`, indexed by `expires`.
pub fn entries_schema() -> TableSchema {
    TableSchema::new(ENTRIES_TABLE, "key").with_index(EXPIRES_INDEX, "expires")
}

/// A value handed to `set_item`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub value: Value,
    /// Absolute expiration. `None` means the adapter's default TTL.
    pub expires: Option<Timestamp>,
}

impl Item {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires: None,
        }
    }

    pub fn expires_at(mut self, at: Timestamp) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn expires_in(self, ttl: Duration) -> Self {
        self.expires_at(Timestamp::now().saturating_add(ttl))
    }
}

impl From<Value> for Item {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// An entry as returned by `get_all`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    pub key: String,
    pub value: Value,
    pub expires: Timestamp,
}

/// The record stored in the entries table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    pub key: String,
    pub value: Value,
    pub size: u64,
    pub expires: Timestamp,
}

impl StoredEntry {
    pub fn to_record(&self) -> AdapterResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_record(record: Value) -> AdapterResult<Self> {
        Ok(serde_json::from_value(record)?)
    }

    pub fn into_item(self) -> CachedItem {
        CachedItem {
            key: self.key,
            value: self.value,
            expires: self.expires,
        }
    }
}

/// The fields of a stored record the sweep needs. Skips decoding the value.
#[derive(Debug, Deserialize)]
pub(crate) struct EntryMeta {
    pub key: String,
    pub size: u64,
    pub expires: Timestamp,
}

impl EntryMeta {
    pub fn from_record(record: &Value) -> AdapterResult<Self> {
        Ok(Self::deserialize(record)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_layout() {
        let entry = StoredEntry {
            key: "user:1".into(),
            value: json!({"name": "ada"}),
            size: 32,
            expires: Timestamp::from_millis(1_000),
        };
        let record = entry.to_record().unwrap();
        assert_eq!(
            record,
            json!({"key": "user:1", "value": {"name": "ada"}, "size": 32, "expires": 1000})
        );
        assert_eq!(StoredEntry::from_record(record.clone()).unwrap(), entry);

        let meta = EntryMeta::from_record(&record).unwrap();
        assert_eq!(meta.key, "user:1");
        assert_eq!(meta.size, 32);
        assert_eq!(meta.expires, Timestamp::from_millis(1_000));
    }

    #[test]
    fn malformed_record_is_a_serialization_error() {
        let err = StoredEntry::from_record(json!({"key": "k"})).unwrap_err();
        assert!(matches!(err, crate::AdapterError::Serialization(_)));
        assert!(EntryMeta::from_record(&json!({"key": 1})).is_err());
    }

    #[test]
    fn item_expiration() {
        let item = Item::from(json!(1));
        assert!(item.expires.is_none());

        let before = Timestamp::now();
        let item = Item::new(json!(1)).expires_in(Duration::from_secs(60));
        let at = item.expires.unwrap();
        assert!(at.as_millis() >= before.as_millis() + 60_000);
    }

    #[test]
    fn schema_indexes_expiration() {
        let schema = entries_schema();
        assert_eq!(schema.name, ENTRIES_TABLE);
        assert_eq!(schema.key_path, "key");
        assert_eq!(schema.index(EXPIRES_INDEX).unwrap().key_path, "expires");
    }
}
