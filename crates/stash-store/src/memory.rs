use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::schema::{TableSchema, TxMode};
use crate::table::{Mutation, Tables};
use crate::traits::{Backend, Database, Transaction, TxOutcome};
use crate::transaction::{StagedTransaction, TxHost};

/// Counters shared by every database a [`MemoryBackend`] opens.
#[derive(Debug, Default)]
pub struct BackendStats {
    transactions: AtomicU64,
    cursors: AtomicU64,
    commits: AtomicU64,
}

impl BackendStats {
    /// Transactions begun.
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Cursors opened.
    pub fn cursors(&self) -> u64 {
        self.cursors.load(Ordering::SeqCst)
    }

    /// Non-empty batches committed successfully.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

/// One-shot failures armed by tests.
#[derive(Debug, Default)]
struct Faults {
    fail_open: Option<String>,
    abort_commit: Option<String>,
    error_commit: Option<String>,
}

struct MemoryCore {
    name: String,
    tables: RwLock<Tables>,
    faults: Arc<Mutex<Faults>>,
    stats: Arc<BackendStats>,
}

impl TxHost for MemoryCore {
    fn tables(&self) -> &RwLock<Tables> {
        &self.tables
    }

    fn commit_batch(&self, batch: Vec<Mutation>) -> TxOutcome {
        {
            let mut faults = self.faults.lock().expect("faults lock poisoned");
            if let Some(reason) = faults.abort_commit.take() {
                return TxOutcome::Abort(reason);
            }
            if let Some(reason) = faults.error_commit.take() {
                return TxOutcome::Error(reason);
            }
        }
        let mut tables = self.tables.write().expect("tables lock poisoned");
        match tables.apply_batch(&batch) {
            Ok(()) => {
                self.stats.commits.fetch_add(1, Ordering::SeqCst);
                debug!(db = %self.name, mutations = batch.len(), "memory commit");
                TxOutcome::Complete
            }
            Err(e) => TxOutcome::Error(e.to_string()),
        }
    }

    fn cursor_opened(&self) {
        self.stats.cursors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle to an in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    core: Arc<MemoryCore>,
}

impl MemoryDatabase {
    /// Number of committed rows in `table`.
    pub fn len(&self, table: &str) -> StoreResult<usize> {
        self.core.tables.read().expect("tables lock poisoned").len(table)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.core.name
    }

    async fn create_indexed_table(&self, schema: TableSchema) -> StoreResult<()> {
        let mut tables = self.core.tables.write().expect("tables lock poisoned");
        let name = schema.name.clone();
        if tables.create(schema) {
            debug!(db = %self.core.name, table = %name, "created table");
        }
        Ok(())
    }

    fn begin(&self, tables: &[&str], mode: TxMode) -> StoreResult<Box<dyn Transaction>> {
        let tx = StagedTransaction::begin(Arc::clone(&self.core), tables, mode)?;
        self.core.stats.transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(tx))
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("name", &self.core.name)
            .finish()
    }
}

/// In-process backend. Databases live as long as the backend and are shared
/// by every `open` of the same name.
///
/// Intended for tests and embedding. Failures can be armed ahead of time with
/// [`fail_next_open`](Self::fail_next_open),
/// [`abort_next_commit`](Self::abort_next_commit) and
/// [`error_next_commit`](Self::error_next_commit); each fires once.
pub struct MemoryBackend {
    databases: Mutex<HashMap<String, Arc<MemoryCore>>>,
    faults: Arc<Mutex<Faults>>,
    stats: Arc<BackendStats>,
}

impl MemoryBackend {
    /// Create a backend with no databases.
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            faults: Arc::new(Mutex::new(Faults::default())),
            stats: Arc::new(BackendStats::default()),
        }
    }

    /// Make the next `open` fail with `reason`.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.faults.lock().expect("faults lock poisoned").fail_open = Some(reason.into());
    }

    /// Make the next non-empty commit report [`TxOutcome::Abort`].
    pub fn abort_next_commit(&self, reason: impl Into<String>) {
        self.faults.lock().expect("faults lock poisoned").abort_commit = Some(reason.into());
    }

    /// Make the next non-empty commit report [`TxOutcome::Error`].
    pub fn error_next_commit(&self, reason: impl Into<String>) {
        self.faults.lock().expect("faults lock poisoned").error_commit = Some(reason.into());
    }

    /// Operation counters.
    pub fn stats(&self) -> Arc<BackendStats> {
        Arc::clone(&self.stats)
    }

    /// Handle to an already opened database, for inspection.
    pub fn database(&self, name: &str) -> Option<MemoryDatabase> {
        let databases = self.databases.lock().expect("databases lock poisoned");
        databases.get(name).map(|core| MemoryDatabase {
            core: Arc::clone(core),
        })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, name: &str) -> StoreResult<Arc<dyn Database>> {
        if let Some(reason) = self.faults.lock().expect("faults lock poisoned").fail_open.take() {
            return Err(StoreError::Open {
                name: name.to_string(),
                reason,
            });
        }
        if name.is_empty() {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let mut databases = self.databases.lock().expect("databases lock poisoned");
        let core = databases
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryCore {
                    name: name.to_string(),
                    tables: RwLock::new(Tables::new()),
                    faults: Arc::clone(&self.faults),
                    stats: Arc::clone(&self.stats),
                })
            })
            .clone();
        Ok(Arc::new(MemoryDatabase { core }))
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.databases.lock().expect("databases lock poisoned").len();
        f.debug_struct("MemoryBackend")
            .field("database_count", &count)
            .finish()
    }
}
