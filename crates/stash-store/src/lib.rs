//! Transactional table storage for Stash.
//!
//! This crate defines the backend contract the cache adapter is written
//! against, shaped like a small embedded database: a named database holds
//! tables of JSON records keyed by a primary key path, each table may carry
//! secondary indexes, and all access goes through transactions that finish
//! with exactly one [`TxOutcome`].
//!
//! # Backends
//!
//! All backends implement the [`Backend`] trait:
//!
//! - [`MemoryBackend`] -- in-process tables for tests and embedding, with
//!   fault injection and operation counters
//! - [`LogBackend`] -- durable tables replayed from an append-only,
//!   CRC-framed mutation log, one file per database
//!
//! # Design Rules
//!
//! 1. A transaction stages its writes; nothing is visible to other
//!    transactions until `commit` reports [`TxOutcome::Complete`].
//! 2. A commit is atomic: either every staged mutation lands or none does.
//! 3. Writes inside a read-only transaction are rejected immediately.
//! 4. Cursors are snapshots taken at open time, merged with the
//!    transaction's own staged writes.
//! 5. Table creation is idempotent.

pub mod cursor;
pub mod error;
pub mod log;
pub mod log_backend;
pub mod memory;
pub mod schema;
pub mod table;
pub mod traits;
pub mod transaction;

pub use cursor::Cursor;
pub use error::{StoreError, StoreResult};
pub use log::{LogConfig, MutationLog, SyncMode};
pub use log_backend::{LogBackend, LogDatabase};
pub use memory::{BackendStats, MemoryBackend, MemoryDatabase};
pub use schema::{IndexKey, IndexSchema, TableSchema, TxMode};
pub use table::{Mutation, Tables};
pub use traits::{Backend, Database, Transaction, TxOutcome};
