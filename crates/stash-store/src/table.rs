use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::schema::{IndexKey, TableSchema};

/// A single staged write, applied to [`Tables`] at commit time.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Insert or replace the record stored under `key`.
    Put {
        table: String,
        key: String,
        record: Value,
    },
    /// Remove the record stored under `key` (no-op if absent).
    Delete { table: String, key: String },
    /// Remove every record in the table.
    Clear { table: String },
}

impl Mutation {
    /// Name of the table this mutation targets.
    pub fn table(&self) -> &str {
        match self {
            Self::Put { table, .. } | Self::Delete { table, .. } | Self::Clear { table } => table,
        }
    }
}

#[derive(Clone, Debug)]
struct Table {
    schema: TableSchema,
    rows: BTreeMap<String, Value>,
}

/// Committed state of a database: every table and its rows, keyed by
/// primary key.
///
/// Both backends keep one of these behind a lock; the log backend rebuilds
/// it on open by replaying its log.
#[derive(Clone, Debug, Default)]
pub struct Tables {
    tables: BTreeMap<String, Table>,
}

impl Tables {
    /// Create an empty table set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table. Returns `false` if a table with that name already
    /// exists (its schema is left untouched).
    pub fn create(&mut self, schema: TableSchema) -> bool {
        if self.tables.contains_key(&schema.name) {
            return false;
        }
        self.tables.insert(
            schema.name.clone(),
            Table {
                schema,
                rows: BTreeMap::new(),
            },
        );
        true
    }

    /// Schema of the named table.
    pub fn schema(&self, table: &str) -> StoreResult<&TableSchema> {
        self.table(table).map(|t| &t.schema)
    }

    /// Returns `true` if the named table exists.
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Iterate over all table schemas in name order.
    pub fn schemas(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values().map(|t| &t.schema)
    }

    /// Read a single record.
    pub fn get(&self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.table(table)?.rows.get(key).cloned())
    }

    /// All rows of a table in primary-key order.
    pub fn rows(&self, table: &str) -> StoreResult<&BTreeMap<String, Value>> {
        Ok(&self.table(table)?.rows)
    }

    /// Number of rows in a table.
    pub fn len(&self, table: &str) -> StoreResult<usize> {
        Ok(self.table(table)?.rows.len())
    }

    /// Apply a batch atomically: every target table is checked before any
    /// mutation is applied.
    pub fn apply_batch(&mut self, batch: &[Mutation]) -> StoreResult<()> {
        if let Some(missing) = batch.iter().find(|m| !self.contains(m.table())) {
            return Err(StoreError::TableNotFound(missing.table().to_string()));
        }
        for mutation in batch {
            self.apply(mutation)?;
        }
        Ok(())
    }

    /// Apply a single mutation.
    pub fn apply(&mut self, mutation: &Mutation) -> StoreResult<()> {
        let table = self
            .tables
            .get_mut(mutation.table())
            .ok_or_else(|| StoreError::TableNotFound(mutation.table().to_string()))?;
        match mutation {
            Mutation::Put { key, record, .. } => {
                table.rows.insert(key.clone(), record.clone());
            }
            Mutation::Delete { key, .. } => {
                table.rows.remove(key);
            }
            Mutation::Clear { .. } => table.rows.clear(),
        }
        Ok(())
    }

    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }
}

/// Order `(key, record)` pairs for a cursor: by primary key when `index_path`
/// is `None`, otherwise by the index value (ties broken by primary key),
/// dropping records that have no usable index value.
pub(crate) fn order_rows(rows: Vec<(String, Value)>, index_path: Option<&str>) -> Vec<Value> {
    match index_path {
        None => {
            let mut rows = rows;
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            rows.into_iter().map(|(_, record)| record).collect()
        }
        Some(path) => {
            let mut keyed: Vec<(IndexKey, String, Value)> = rows
                .into_iter()
                .filter_map(|(key, record)| {
                    IndexKey::extract(&record, path).map(|ik| (ik, key, record))
                })
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            keyed.into_iter().map(|(_, _, record)| record).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tables() -> Tables {
        let mut t = Tables::new();
        assert!(t.create(TableSchema::new("entries", "key").with_index("expires", "expires")));
        t
    }

    fn put(key: &str, expires: u64) -> Mutation {
        Mutation::Put {
            table: "entries".into(),
            key: key.into(),
            record: json!({"key": key, "expires": expires}),
        }
    }

    #[test]
    fn create_is_idempotent() {
        let mut t = tables();
        assert!(!t.create(TableSchema::new("entries", "other")));
        assert_eq!(t.schema("entries").unwrap().key_path, "key");
    }

    #[test]
    fn put_get_delete_clear() {
        let mut t = tables();
        t.apply(&put("a", 1)).unwrap();
        t.apply(&put("b", 2)).unwrap();
        assert_eq!(t.len("entries").unwrap(), 2);
        assert_eq!(t.get("entries", "a").unwrap(), Some(json!({"key": "a", "expires": 1})));

        t.apply(&Mutation::Delete { table: "entries".into(), key: "a".into() }).unwrap();
        assert!(t.get("entries", "a").unwrap().is_none());

        t.apply(&Mutation::Clear { table: "entries".into() }).unwrap();
        assert_eq!(t.len("entries").unwrap(), 0);
    }

    #[test]
    fn batch_with_unknown_table_applies_nothing() {
        let mut t = tables();
        let batch = vec![
            put("a", 1),
            Mutation::Clear { table: "missing".into() },
        ];
        assert!(matches!(t.apply_batch(&batch), Err(StoreError::TableNotFound(_))));
        assert_eq!(t.len("entries").unwrap(), 0);
    }

    #[test]
    fn order_by_index_then_key() {
        let rows = vec![
            ("c".to_string(), json!({"key": "c", "expires": 5})),
            ("a".to_string(), json!({"key": "a", "expires": 9})),
            ("b".to_string(), json!({"key": "b", "expires": 5})),
            ("z".to_string(), json!({"key": "z"})),
        ];
        let ordered = order_rows(rows, Some("expires"));
        let keys: Vec<&str> = ordered.iter().map(|r| r["key"].as_str().unwrap()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[test]
    fn order_by_primary_key() {
        let rows = vec![
            ("b".to_string(), json!({"key": "b"})),
            ("a".to_string(), json!({"key": "a"})),
        ];
        let ordered = order_rows(rows, None);
        assert_eq!(ordered[0]["key"], "a");
        assert_eq!(ordered[1]["key"], "b");
    }
}
