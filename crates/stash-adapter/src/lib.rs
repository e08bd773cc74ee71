//! Persistent, size-bounded key/value cache for Stash.
//!
//! [`PersistentAdapter`] stores JSON values with an expiration time in a
//! transactional [`Backend`](stash_store::Backend) and keeps the store under
//! a configured capacity. It never asks the backend how large the store is.
//! Instead it estimates the size of every write, tracks the uncertainty of
//! that estimate, and reconciles with the real total whenever it walks the
//! whole store.
//!
//! # Components
//!
//! - [`SizeEstimator`] -- running size guess with an error bar and drift
//!   statistics
//! - [`RequestQueue`] -- parks requests while the store opens, replays them
//!   in order once it is ready
//! - [`SweepReport`] -- the outcome of an eviction pass over the expiration
//!   index
//! - [`AdapterRegistry`] -- adapter implementations a host can choose from
//!
//! # Capacity
//!
//! With `max_size` as the capacity:
//!
//! | Threshold  | Share | Effect                                    |
//! |------------|-------|-------------------------------------------|
//! | sweep high | 90%   | writes past it sweep first                |
//! | sweep low  | 70%   | a sweep evicts down to it                 |
//! | item       | 25%   | larger entries are rejected               |
//! | error      | 50%   | a wider error bar forces a sweep on write |

/// Log at `info` when diagnostics are enabled, at `debug` otherwise.
macro_rules! diag {
    ($enabled:expr, $($arg:tt)+) => {
        if $enabled {
            ::tracing::info!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}

pub mod adapter;
pub mod config;
pub mod entry;
pub mod error;
pub mod estimator;
pub(crate) mod executor;
pub mod queue;
pub mod registry;
pub mod sweep;
pub mod traits;

pub use adapter::PersistentAdapter;
pub use config::{AdapterConfig, Thresholds, Tuning, DEFAULT_MAX_SIZE};
pub use entry::{CachedItem, Item, ENTRIES_TABLE, EXPIRES_INDEX};
pub use error::{AdapterError, AdapterResult, TxState};
pub use estimator::{MistakeStats, SizeEstimator, SizeStats};
pub use queue::{RequestQueue, StoreState};
pub use registry::{AdapterCapabilities, AdapterFactory, AdapterRegistry};
pub use sweep::SweepReport;
pub use traits::StorageAdapter;
