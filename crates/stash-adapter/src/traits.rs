use async_trait::async_trait;
use serde_json::Value;

use crate::entry::{CachedItem, Item};
use crate::error::AdapterResult;

/// The operations every cache adapter provides.
///
/// Callers that hold adapters through an
/// [`AdapterRegistry`](crate::AdapterRegistry) see them only through this
/// trait.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Identifier of the adapter implementation.
    fn name(&self) -> &str;

    /// Approximate number of bytes stored.
    async fn get_size(&self) -> AdapterResult<f64>;

    async fn get_item(&self, key: &str) -> AdapterResult<Option<Value>>;

    /// Every stored entry, soonest expiring first.
    async fn get_all(&self) -> AdapterResult<Vec<CachedItem>>;

    /// Insert or replace the entry under `key`.
    async fn set_item(&self, key: &str, item: Item) -> AdapterResult<()>;

    async fn remove_item(&self, key: &str) -> AdapterResult<()>;

    async fn clear(&self) -> AdapterResult<()>;

    /// Evict expired entries, and more if the store is over capacity.
    async fn sweep(&self) -> AdapterResult<()>;
}
