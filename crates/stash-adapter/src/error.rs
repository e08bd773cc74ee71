use std::fmt;

use stash_store::StoreError;

/// How far a failed transaction got before it ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// The backend refused to start the transaction.
    NotStarted,
    /// The transaction was rolled back.
    Aborted,
    /// The backend failed while committing.
    Errored,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Aborted => f.write_str("aborted"),
            Self::Errored => f.write_str("errored"),
        }
    }
}

/// Errors surfaced by the cache adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The backing store could not be opened. Terminal for the adapter.
    #[error("persistent store failed to initialize")]
    InitializationFailed,

    /// A backend transaction did not complete.
    #[error("{operation} failed: transaction {state}: {reason}")]
    Transaction {
        operation: &'static str,
        state: TxState,
        reason: String,
    },

    /// The entry is larger than the per-item limit and was not written.
    #[error("item {key:?} is too large: {size} bytes exceeds the {limit} byte limit")]
    ItemTooLarge { key: String, size: u64, limit: u64 },

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// No adapter with this name is registered.
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    /// An adapter with this name is already registered.
    #[error("adapter already registered: {0}")]
    DuplicateAdapter(String),
}

impl AdapterError {
    /// Build a [`AdapterError::Transaction`] for `operation`.
    pub fn transaction(operation: &'static str, state: TxState, reason: impl Into<String>) -> Self {
        Self::Transaction {
            operation,
            state,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the adapter can never serve requests again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InitializationFailed)
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for AdapterError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convenience alias for adapter results.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Store errors raised inside a transaction body abort that transaction.
pub(crate) fn aborted(operation: &'static str, e: &StoreError) -> AdapterError {
    AdapterError::transaction(operation, TxState::Aborted, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_message_is_fixed() {
        assert_eq!(
            AdapterError::InitializationFailed.to_string(),
            "persistent store failed to initialize"
        );
        assert!(AdapterError::InitializationFailed.is_terminal());
    }

    #[test]
    fn transaction_message_names_operation_and_state() {
        let e = AdapterError::transaction("set_item", TxState::Aborted, "quota exceeded");
        assert_eq!(e.to_string(), "set_item failed: transaction aborted: quota exceeded");
        assert!(!e.is_terminal());

        let e = AdapterError::transaction("clear", TxState::Errored, "disk full");
        assert_eq!(e.to_string(), "clear failed: transaction errored: disk full");
    }

    #[test]
    fn item_too_large_message() {
        let e = AdapterError::ItemTooLarge {
            key: "k".into(),
            size: 260,
            limit: 250,
        };
        assert_eq!(
            e.to_string(),
            "item \"k\" is too large: 260 bytes exceeds the 250 byte limit"
        );
    }
}
