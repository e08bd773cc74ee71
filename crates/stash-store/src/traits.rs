//! The backend contract: [`Backend`], [`Database`], and [`Transaction`].
//!
//! The cache adapter only ever talks to these traits, so any storage engine
//! that can provide named databases, indexed tables, and atomic transactions
//! can sit underneath it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::cursor::Cursor;
use crate::error::StoreResult;
use crate::schema::{TableSchema, TxMode};

/// How a transaction finished. Exactly one outcome is reported per
/// transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// Every staged mutation was committed.
    Complete,
    /// The transaction was rolled back, either on request or by the backend.
    Abort(String),
    /// The backend failed while committing; nothing was applied.
    Error(String),
}

impl TxOutcome {
    /// Returns `true` for [`TxOutcome::Complete`].
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::Abort(reason) => write!(f, "aborted: {reason}"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// A storage engine that can open named databases.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier for the engine (e.g. `"memory"`, `"log"`).
    fn kind(&self) -> &'static str;

    /// Open (or create) the database called `name`.
    ///
    /// Resolves once, with either a ready handle or the reason opening
    /// failed.
    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Database>>;
}

/// An open database handle. Shared by every transaction started from it.
#[async_trait]
pub trait Database: Send + Sync {
    /// The name this database was opened with.
    fn name(&self) -> &str;

    /// Create a table with its secondary indexes.
    ///
    /// Idempotent: if a table with the same name exists, it is kept as is
    /// and `Ok(())` is returned.
    async fn create_indexed_table(&self, schema: TableSchema) -> StoreResult<()>;

    /// Begin a transaction scoped to `tables`.
    ///
    /// Fails if any table in the scope does not exist.
    fn begin(&self, tables: &[&str], mode: TxMode) -> StoreResult<Box<dyn Transaction>>;
}

/// A unit of work against a [`Database`].
///
/// Reads observe committed state plus this transaction's own staged writes.
/// Dropping a transaction without calling [`commit`](Transaction::commit)
/// discards its staged writes.
#[async_trait]
pub trait Transaction: Send {
    /// The mode the transaction was started with.
    fn mode(&self) -> TxMode;

    /// Read the record stored under `key`.
    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<Value>>;

    /// Insert or replace a record. The key is taken from the table's key path.
    async fn put(&mut self, table: &str, record: Value) -> StoreResult<()>;

    /// Delete the record stored under `key`. Deleting a missing key is not an
    /// error.
    async fn delete(&mut self, table: &str, key: &str) -> StoreResult<()>;

    /// Delete every record in the table.
    async fn clear(&mut self, table: &str) -> StoreResult<()>;

    /// Open a cursor over the table, ordered by primary key, or by the named
    /// index when `index` is given.
    async fn open_cursor(&mut self, table: &str, index: Option<&str>) -> StoreResult<Cursor>;

    /// Commit staged writes and report how the transaction ended.
    async fn commit(self: Box<Self>) -> TxOutcome;

    /// Discard staged writes.
    fn abort(self: Box<Self>, reason: &str) -> TxOutcome;
}
