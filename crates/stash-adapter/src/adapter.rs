use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use stash_store::{Backend, Database, StoreResult, TxMode};
use stash_types::{estimate_entry_size, Timestamp};
use tracing::{info, warn};

use crate::config::{AdapterConfig, Thresholds};
use crate::entry::{entries_schema, CachedItem, Item, StoredEntry, ENTRIES_TABLE};
use crate::error::{AdapterError, AdapterResult};
use crate::estimator::{SizeEstimator, SizeStats};
use crate::executor::{scan_entries, OpTransaction, ScanOutcome};
use crate::queue::{RequestQueue, StoreState};
use crate::registry::{AdapterCapabilities, AdapterFactory};
use crate::sweep::{SweepEngine, SweepReport};
use crate::traits::StorageAdapter;

struct Shared {
    config: AdapterConfig,
    thresholds: Thresholds,
    estimator: Mutex<SizeEstimator>,
    sweeper: SweepEngine,
    queue: RequestQueue,
}

impl Shared {
    fn diagnostics(&self) -> bool {
        self.config.debug_logging
    }

    fn fresh_guess(&self) -> Option<f64> {
        let estimator = self.estimator.lock().expect("estimator lock poisoned");
        estimator.is_fresh().then(|| estimator.guess())
    }

    /// Open the database, make sure the entries table exists and seed the
    /// estimator from what is already stored, then release parked requests.
    async fn open_store(&self, backend: Arc<dyn Backend>) {
        let name = self.config.name.as_str();
        let opened: StoreResult<Arc<dyn Database>> = async {
            let db = backend.open(name).await?;
            db.create_indexed_table(entries_schema()).await?;
            Ok(db)
        }
        .await;

        let db = match opened {
            Ok(db) => db,
            Err(e) => {
                warn!(store = name, backend = backend.kind(), error = %e, "store failed to initialize");
                self.queue.fail();
                return;
            }
        };

        match scan_entries(db.as_ref(), "open", false).await {
            Ok(scan) => {
                let mut estimator = self.estimator.lock().expect("estimator lock poisoned");
                estimator.set_size(scan.size, scan.count);
            }
            Err(e) => warn!(store = name, error = %e, "could not measure existing entries"),
        }
        info!(store = name, backend = backend.kind(), "store ready");
        self.queue.open(db).await;
    }

    async fn get(&self, db: &dyn Database, key: &str) -> AdapterResult<Option<Value>> {
        let mut op = OpTransaction::begin(db, "get_item", TxMode::ReadOnly)?;
        let body = op.tx().get(ENTRIES_TABLE, key).await;
        match op.finish(body).await? {
            Some(record) => Ok(Some(StoredEntry::from_record(record)?.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, db: &dyn Database, key: String, item: Item) -> AdapterResult<()> {
        let size = estimate_entry_size(&key, &item.value);
        let weight = size as f64;
        if weight > self.thresholds.item {
            return Err(AdapterError::ItemTooLarge {
                key,
                size,
                limit: self.thresholds.item as u64,
            });
        }
        let expires = item
            .expires
            .unwrap_or_else(|| Timestamp::now().saturating_add(self.config.tuning.default_ttl()));

        let (guess, error_bar) = {
            let estimator = self.estimator.lock().expect("estimator lock poisoned");
            (estimator.guess(), estimator.error_bar())
        };
        if guess + weight > self.thresholds.sweep_high || error_bar > self.thresholds.error {
            if let Err(e) = self.sweeper.sweep(db, &self.estimator, weight).await {
                warn!(key = %key, error = %e, "sweep before write failed; writing anyway");
            }
        }
        self.estimator
            .lock()
            .expect("estimator lock poisoned")
            .update_size(weight, weight / 2.0);

        let record = StoredEntry {
            key,
            value: item.value,
            size,
            expires,
        }
        .to_record()?;
        let mut op = OpTransaction::begin(db, "set_item", TxMode::ReadWrite)?;
        let body = op.tx().put(ENTRIES_TABLE, record).await;
        op.finish(body).await
    }

    async fn remove(&self, db: &dyn Database, key: &str) -> AdapterResult<()> {
        {
            let mut estimator = self.estimator.lock().expect("estimator lock poisoned");
            let avg = estimator.avg_entry_size();
            estimator.update_size(-avg, avg);
        }
        let mut op = OpTransaction::begin(db, "remove_item", TxMode::ReadWrite)?;
        let body = op.tx().delete(ENTRIES_TABLE, key).await;
        op.finish(body).await
    }

    async fn clear(&self, db: &dyn Database) -> AdapterResult<()> {
        self.estimator
            .lock()
            .expect("estimator lock poisoned")
            .set_size(0.0, 0);
        let mut op = OpTransaction::begin(db, "clear", TxMode::ReadWrite)?;
        let body = op.tx().clear(ENTRIES_TABLE).await;
        op.finish(body).await
    }

    /// Full scan that reconciles the estimator, followed by a best-effort
    /// sweep when the store turns out to be over the high-water mark.
    async fn scan(
        &self,
        db: &dyn Database,
        operation: &'static str,
        collect: bool,
    ) -> AdapterResult<ScanOutcome> {
        let outcome = scan_entries(db, operation, collect).await?;
        let stats = {
            let mut estimator = self.estimator.lock().expect("estimator lock poisoned");
            estimator.reconcile(outcome.size, outcome.count);
            estimator.stats()
        };
        diag!(
            self.diagnostics(),
            operation,
            size = outcome.size,
            count = outcome.count,
            mistake = stats.mistakes.mean(),
            mistake_max = stats.mistakes.max,
            outside_error_bar = stats.mistakes.outside_error_bar,
            "estimator reconciled"
        );
        if outcome.size > self.thresholds.sweep_high {
            if let Err(e) = self.sweeper.sweep(db, &self.estimator, 0.0).await {
                warn!(operation, error = %e, "sweep after scan failed");
            }
        }
        Ok(outcome)
    }
}

/// Cache adapter over a transactional [`Backend`], bounded to
/// `max_size` estimated bytes.
///
/// The backing database opens in the background. Requests made before it is
/// ready wait and then run in the order they were made; if it fails to open,
/// every request fails with [`AdapterError::InitializationFailed`].
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct PersistentAdapter {
    shared: Arc<Shared>,
}

impl PersistentAdapter {
    /// Identifier reported by [`StorageAdapter::name`].
    pub const NAME: &'static str = "persistent";

    /// Start opening `config.name` on `backend` and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(backend: Arc<dyn Backend>, config: AdapterConfig) -> AdapterResult<Self> {
        config.validate()?;
        let thresholds = config.thresholds();
        let shared = Arc::new(Shared {
            estimator: Mutex::new(SizeEstimator::new(config.tuning.freshness_threshold)),
            sweeper: SweepEngine::new(thresholds, config.tuning.clone(), config.debug_logging),
            queue: RequestQueue::new(),
            thresholds,
            config,
        });
        let opener = Arc::clone(&shared);
        tokio::spawn(async move { opener.open_store(backend).await });
        Ok(Self { shared })
    }

    /// Descriptor used when registering this adapter.
    pub fn capabilities() -> AdapterCapabilities {
        AdapterCapabilities::new(Self::NAME, true)
    }

    /// A registry factory building adapters over `backend`.
    pub fn factory(backend: Arc<dyn Backend>) -> AdapterFactory {
        Box::new(move |config| {
            let adapter = Self::open(Arc::clone(&backend), config)?;
            Ok(Arc::new(adapter) as Arc<dyn StorageAdapter>)
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    pub fn thresholds(&self) -> Thresholds {
        self.shared.thresholds
    }

    pub fn state(&self) -> StoreState {
        self.shared.queue.state()
    }

    /// Requests waiting for the store to open.
    pub fn pending_requests(&self) -> usize {
        self.shared.queue.pending()
    }

    pub fn size_stats(&self) -> SizeStats {
        self.shared
            .estimator
            .lock()
            .expect("estimator lock poisoned")
            .stats()
    }

    /// When the last sweep started, if any.
    pub fn last_sweep(&self) -> Option<Timestamp> {
        self.shared.sweeper.last_sweep()
    }

    /// Wait until the store has opened.
    pub async fn ready(&self) -> AdapterResult<()> {
        self.submit(|_, _| async { Ok(()) }).await
    }

    /// Approximate size in bytes. Answers from the estimator while it is
    /// fresh, otherwise scans the store.
    ///
    /// Until the store has opened the estimator holds no measurement, so the
    /// call waits for the open like any other request.
    pub async fn get_size(&self) -> AdapterResult<f64> {
        if self.state() == StoreState::Ready {
            if let Some(guess) = self.shared.fresh_guess() {
                return Ok(guess);
            }
        }
        self.submit(|shared, db| async move {
            if let Some(guess) = shared.fresh_guess() {
                return Ok(guess);
            }
            let outcome = shared.scan(db.as_ref(), "get_size", false).await?;
            Ok(outcome.size)
        })
        .await
    }

    pub async fn get_item(&self, key: &str) -> AdapterResult<Option<Value>> {
        let key = key.to_string();
        self.submit(move |shared, db| async move { shared.get(db.as_ref(), &key).await })
            .await
    }

    /// Every entry, soonest expiring first. Reconciles the size estimate.
    pub async fn get_all(&self) -> AdapterResult<Vec<CachedItem>> {
        self.submit(|shared, db| async move {
            let outcome = shared.scan(db.as_ref(), "get_all", true).await?;
            Ok(outcome.items)
        })
        .await
    }

    /// Store `item` under `key`, evicting first if the store would grow past
    /// its high-water mark.
    pub async fn set_item(&self, key: &str, item: impl Into<Item>) -> AdapterResult<()> {
        let key = key.to_string();
        let item = item.into();
        self.submit(move |shared, db| async move { shared.set(db.as_ref(), key, item).await })
            .await
    }

    pub async fn remove_item(&self, key: &str) -> AdapterResult<()> {
        let key = key.to_string();
        self.submit(move |shared, db| async move { shared.remove(db.as_ref(), &key).await })
            .await
    }

    pub async fn clear(&self) -> AdapterResult<()> {
        self.submit(|shared, db| async move { shared.clear(db.as_ref()).await })
            .await
    }

    pub async fn sweep(&self) -> AdapterResult<SweepReport> {
        self.submit(|shared, db| async move {
            shared
                .sweeper
                .sweep(db.as_ref(), &shared.estimator, 0.0)
                .await
        })
        .await
    }

    async fn submit<F, Fut, T>(&self, operation: F) -> AdapterResult<T>
    where
        F: FnOnce(Arc<Shared>, Arc<dyn Database>) -> Fut + Send + 'static,
        Fut: Future<Output = AdapterResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared
            .queue
            .submit(move |db| operation(shared, db))
            .await
    }
}

impl fmt::Debug for PersistentAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentAdapter")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("max_size", &self.shared.config.max_size)
            .finish()
    }
}

#[async_trait]
impl StorageAdapter for PersistentAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn get_size(&self) -> AdapterResult<f64> {
        PersistentAdapter::get_size(self).await
    }

    async fn get_item(&self, key: &str) -> AdapterResult<Option<Value>> {
        PersistentAdapter::get_item(self, key).await
    }

    async fn get_all(&self) -> AdapterResult<Vec<CachedItem>> {
        PersistentAdapter::get_all(self).await
    }

    async fn set_item(&self, key: &str, item: Item) -> AdapterResult<()> {
        PersistentAdapter::set_item(self, key, item).await
    }

    async fn remove_item(&self, key: &str) -> AdapterResult<()> {
        PersistentAdapter::remove_item(self, key).await
    }

    async fn clear(&self) -> AdapterResult<()> {
        PersistentAdapter::clear(self).await
    }

    async fn sweep(&self) -> AdapterResult<()> {
        PersistentAdapter::sweep(self).await.map(|_| ())
    }
}
