use std::io;

/// Errors from storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the underlying storage medium.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The database name cannot be used (empty or contains path separators).
    #[error("invalid database name: {0:?}")]
    InvalidName(String),

    /// The database could not be opened.
    #[error("failed to open database {name}: {reason}")]
    Open { name: String, reason: String },

    /// The named table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The table exists but was not part of the transaction's scope.
    #[error("table {0} is not in the transaction scope")]
    NotInScope(String),

    /// The named index does not exist on the table.
    #[error("index {index} not found on table {table}")]
    UnknownIndex { table: String, index: String },

    /// A record is missing its primary key or the key is not a string.
    #[error("record for table {table} has no string key at {key_path:?}")]
    MissingKey { table: String, key_path: String },

    /// A write was attempted in a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
