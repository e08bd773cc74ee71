use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::{StoreError, StoreResult};
use crate::schema::TxMode;
use crate::table::{order_rows, Mutation, Tables};
use crate::traits::{Transaction, TxOutcome};

/// What a backend provides to [`StagedTransaction`]: its committed tables
/// and a way to make a batch of mutations durable.
pub(crate) trait TxHost: Send + Sync + 'static {
    /// Committed state.
    fn tables(&self) -> &RwLock<Tables>;

    /// Atomically apply a non-empty batch.
    fn commit_batch(&self, batch: Vec<Mutation>) -> TxOutcome;

    /// Called every time a cursor is opened.
    fn cursor_opened(&self) {}
}

/// Transaction that buffers writes locally and hands them to its host as a
/// single batch on commit.
pub(crate) struct StagedTransaction<H: TxHost> {
    host: Arc<H>,
    scope: Vec<String>,
    mode: TxMode,
    staged: Vec<Mutation>,
    /// Per-table view of staged writes: `Some` for puts, `None` for deletes.
    overlay: BTreeMap<String, BTreeMap<String, Option<Value>>>,
    /// Tables cleared by this transaction.
    cleared: HashSet<String>,
}

impl<H: TxHost> StagedTransaction<H> {
    /// Start a transaction over `tables`, which must all exist.
    pub(crate) fn begin(host: Arc<H>, tables: &[&str], mode: TxMode) -> StoreResult<Self> {
        {
            let committed = host.tables().read().expect("tables lock poisoned");
            if let Some(missing) = tables.iter().find(|t| !committed.contains(t)) {
                return Err(StoreError::TableNotFound(missing.to_string()));
            }
        }
        Ok(Self {
            host,
            scope: tables.iter().map(|t| t.to_string()).collect(),
            mode,
            staged: Vec::new(),
            overlay: BTreeMap::new(),
            cleared: HashSet::new(),
        })
    }

    fn check_scope(&self, table: &str) -> StoreResult<()> {
        if self.scope.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(StoreError::NotInScope(table.to_string()))
        }
    }

    fn check_writable(&self, table: &str) -> StoreResult<()> {
        self.check_scope(table)?;
        match self.mode {
            TxMode::ReadWrite => Ok(()),
            TxMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }

    fn stage(&mut self, table: &str, key: String, record: Option<Value>) {
        self.overlay
            .entry(table.to_string())
            .or_default()
            .insert(key, record);
    }
}

#[async_trait]
impl<H: TxHost> Transaction for StagedTransaction<H> {
    fn mode(&self) -> TxMode {
        self.mode
    }

    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        self.check_scope(table)?;
        if let Some(staged) = self.overlay.get(table).and_then(|rows| rows.get(key)) {
            return Ok(staged.clone());
        }
        if self.cleared.contains(table) {
            return Ok(None);
        }
        let committed = self.host.tables().read().expect("tables lock poisoned");
        committed.get(table, key)
    }

    async fn put(&mut self, table: &str, record: Value) -> StoreResult<()> {
        self.check_writable(table)?;
        let key = {
            let committed = self.host.tables().read().expect("tables lock poisoned");
            committed.schema(table)?.primary_key(&record)?
        };
        self.stage(table, key.clone(), Some(record.clone()));
        self.staged.push(Mutation::Put {
            table: table.to_string(),
            key,
            record,
        });
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()> {
        self.check_writable(table)?;
        self.stage(table, key.to_string(), None);
        self.staged.push(Mutation::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn clear(&mut self, table: &str) -> StoreResult<()> {
        self.check_writable(table)?;
        self.overlay.remove(table);
        self.cleared.insert(table.to_string());
        self.staged.push(Mutation::Clear {
            table: table.to_string(),
        });
        Ok(())
    }

    async fn open_cursor(&mut self, table: &str, index: Option<&str>) -> StoreResult<Cursor> {
        self.check_scope(table)?;
        let mut rows: BTreeMap<String, Value> = BTreeMap::new();
        let index_path = {
            let committed = self.host.tables().read().expect("tables lock poisoned");
            let schema = committed.schema(table)?;
            let index_path = match index {
                Some(name) => Some(
                    schema
                        .index(name)
                        .ok_or_else(|| StoreError::UnknownIndex {
                            table: table.to_string(),
                            index: name.to_string(),
                        })?
                        .key_path
                        .clone(),
                ),
                None => None,
            };
            if !self.cleared.contains(table) {
                rows.extend(
                    committed
                        .rows(table)?
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
            index_path
        };

        if let Some(staged) = self.overlay.get(table) {
            for (key, record) in staged {
                match record {
                    Some(record) => {
                        rows.insert(key.clone(), record.clone());
                    }
                    None => {
                        rows.remove(key);
                    }
                }
            }
        }

        self.host.cursor_opened();
        Ok(Cursor::new(order_rows(
            rows.into_iter().collect(),
            index_path.as_deref(),
        )))
    }

    async fn commit(self: Box<Self>) -> TxOutcome {
        let Self { host, staged, .. } = *self;
        if staged.is_empty() {
            return TxOutcome::Complete;
        }
        host.commit_batch(staged)
    }

    fn abort(self: Box<Self>, reason: &str) -> TxOutcome {
        TxOutcome::Abort(reason.to_string())
    }
}
