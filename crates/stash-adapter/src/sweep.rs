//! Eviction of expired and surplus entries.
//!
//! A pass walks the `expires` index from the soonest expiration onward,
//! deleting every entry that is expired (or about to be) and, beyond those,
//! as many of the soonest-expiring entries as needed to free the requested
//! space plus whatever brings the store back down to the low-water mark.
//! The entries that survive are counted, and that count is the exact size
//! the estimator is reconciled to. Records with no usable expiration never
//! reach the index, so a pass finishes with a walk over the primary keys
//! that drops them.

use std::collections::HashSet;
use std::sync::Mutex;

use stash_store::{Database, StoreResult, TxMode};
use serde_json::Value;
use stash_types::Timestamp;
use tracing::warn;

use crate::config::{Thresholds, Tuning};
use crate::entry::{EntryMeta, ENTRIES_TABLE, EXPIRES_INDEX};
use crate::error::AdapterResult;
use crate::estimator::SizeEstimator;
use crate::executor::OpTransaction;

/// What a call to [`SweepEngine::sweep`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SweepReport {
    /// The sweep was debounced and did not touch the store.
    pub skipped: bool,
    /// Passes run, including an automatic re-trigger.
    pub passes: u32,
    pub removed: u64,
    pub removed_size: f64,
    /// Entries left after the final pass.
    pub retained: u64,
    pub retained_size: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct PassTally {
    removed: u64,
    removed_size: f64,
    retained: u64,
    retained_size: f64,
}

impl SweepReport {
    fn absorb(&mut self, pass: PassTally) {
        self.passes += 1;
        self.removed += pass.removed;
        self.removed_size += pass.removed_size;
        self.retained = pass.retained;
        self.retained_size = pass.retained_size;
    }
}

pub(crate) struct SweepEngine {
    thresholds: Thresholds,
    tuning: Tuning,
    debug_logging: bool,
    last_sweep: Mutex<Option<Timestamp>>,
}

impl SweepEngine {
    pub fn new(thresholds: Thresholds, tuning: Tuning, debug_logging: bool) -> Self {
        Self {
            thresholds,
            tuning,
            debug_logging,
            last_sweep: Mutex::new(None),
        }
    }

    /// When the most recent sweep started.
    pub fn last_sweep(&self) -> Option<Timestamp> {
        *self.last_sweep.lock().expect("sweep lock poisoned")
    }

    /// Sweep the store, freeing at least `requested` bytes beyond what is
    /// needed to get under the low-water mark.
    ///
    /// Debounced: a sweep within `sweep_interval` of the previous one is
    /// skipped unless the guess is over the high-water mark. If a pass
    /// leaves the store over the high-water mark, one more pass runs.
    pub async fn sweep(
        &self,
        db: &dyn Database,
        estimator: &Mutex<SizeEstimator>,
        requested: f64,
    ) -> AdapterResult<SweepReport> {
        let mut report = SweepReport::default();
        if !self.claim(estimator) {
            diag!(self.debug_logging, "sweep debounced");
            report.skipped = true;
            return Ok(report);
        }

        report.absorb(self.pass(db, estimator, requested).await?);
        if report.retained_size > self.thresholds.sweep_high {
            report.absorb(self.pass(db, estimator, 0.0).await?);
            if report.retained_size > self.thresholds.sweep_high {
                warn!(
                    size = report.retained_size,
                    high = self.thresholds.sweep_high,
                    "store still over the high-water mark after sweeping"
                );
            }
        }
        Ok(report)
    }

    /// Decide whether a sweep may start now and, if so, stamp it.
    ///
    /// The check and the stamp happen under one lock, so of two concurrent
    /// callers only one gets past the debounce. Lock order is `last_sweep`
    /// then the estimator.
    fn claim(&self, estimator: &Mutex<SizeEstimator>) -> bool {
        let mut last = self.last_sweep.lock().expect("sweep lock poisoned");
        let now = Timestamp::now();
        if let Some(previous) = *last {
            let recent = now.duration_since(previous) < self.tuning.sweep_interval();
            let guess = estimator.lock().expect("estimator lock poisoned").guess();
            if recent && guess < self.thresholds.sweep_high {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    async fn pass(
        &self,
        db: &dyn Database,
        estimator: &Mutex<SizeEstimator>,
        requested: f64,
    ) -> AdapterResult<PassTally> {
        let now = Timestamp::now();
        let guess = estimator.lock().expect("estimator lock poisoned").guess();
        let mut remove_size = requested;
        if guess > self.thresholds.sweep_low {
            remove_size += guess - self.thresholds.sweep_low;
        }
        let cutoff = now.saturating_add(self.tuning.expires_fudge());

        let mut op = OpTransaction::begin(db, "sweep", TxMode::ReadWrite)?;
        let body: StoreResult<PassTally> = async {
            let tx = op.tx();
            let cursor = tx.open_cursor(ENTRIES_TABLE, Some(EXPIRES_INDEX)).await?;
            let mut tally = PassTally::default();
            let mut indexed = HashSet::with_capacity(cursor.remaining());
            for record in cursor {
                if let Some(key) = record.get("key").and_then(Value::as_str) {
                    indexed.insert(key.to_string());
                }
                let entry = match EntryMeta::from_record(&record) {
                    Ok(entry) => entry,
                    Err(e) => {
                        // Unreadable records are dropped; their size is unknown.
                        warn!(error = %e, "removing malformed cache record");
                        if let Some(key) = record.get("key").and_then(Value::as_str) {
                            tx.delete(ENTRIES_TABLE, key).await?;
                        }
                        continue;
                    }
                };
                let size = entry.size as f64;
                if entry.expires.is_before(&cutoff) || tally.removed_size < remove_size {
                    tx.delete(ENTRIES_TABLE, &entry.key).await?;
                    tally.removed += 1;
                    tally.removed_size += size;
                } else {
                    tally.retained += 1;
                    tally.retained_size += size;
                }
            }

            let all = tx.open_cursor(ENTRIES_TABLE, None).await?;
            for record in all {
                let Some(key) = record.get("key").and_then(Value::as_str) else {
                    continue;
                };
                if !indexed.contains(key) {
                    warn!(key, "removing cache record without an expiration");
                    tx.delete(ENTRIES_TABLE, key).await?;
                }
            }
            Ok(tally)
        }
        .await;
        let tally = op.finish(body).await?;

        let stats = {
            let mut estimator = estimator.lock().expect("estimator lock poisoned");
            estimator.reconcile(tally.retained_size, tally.retained);
            estimator.stats()
        };
        diag!(
            self.debug_logging,
            requested,
            remove_size,
            removed = tally.removed,
            removed_size = tally.removed_size,
            retained = tally.retained,
            retained_size = tally.retained_size,
            mistake = stats.mistakes.mean(),
            mistake_max = stats.mistakes.max,
            outside_error_bar = stats.mistakes.outside_error_bar,
            "sweep pass complete"
        );
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{entries_schema, StoredEntry};
    use serde_json::json;
    use stash_store::{Backend, MemoryBackend};
    use std::sync::Arc;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        backend: MemoryBackend,
        db: Arc<dyn Database>,
        estimator: Mutex<SizeEstimator>,
        engine: SweepEngine,
    }

    async fn fixture(max_size: u64) -> Fixture {
        let backend = MemoryBackend::new();
        let db = backend.open("sweep").await.unwrap();
        db.create_indexed_table(entries_schema()).await.unwrap();
        Fixture {
            backend,
            db,
            estimator: Mutex::new(SizeEstimator::new(50)),
            engine: SweepEngine::new(Thresholds::from_max_size(max_size), Tuning::default(), false),
        }
    }

    /// Store entries directly, bypassing the estimator.
    async fn seed(db: &dyn Database, entries: &[(&str, u64, Timestamp)]) {
        let mut tx = db.begin(&[ENTRIES_TABLE], TxMode::ReadWrite).unwrap();
        for (key, size, expires) in entries {
            let record = StoredEntry {
                key: key.to_string(),
                value: json!(null),
                size: *size,
                expires: *expires,
            }
            .to_record()
            .unwrap();
            tx.put(ENTRIES_TABLE, record).await.unwrap();
        }
        assert!(tx.commit().await.is_complete());
    }

    async fn keys(db: &dyn Database) -> Vec<String> {
        let mut tx = db.begin(&[ENTRIES_TABLE], TxMode::ReadOnly).unwrap();
        tx.open_cursor(ENTRIES_TABLE, Some(EXPIRES_INDEX))
            .await
            .unwrap()
            .map(|r| r["key"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn removes_expired_entries() {
        let f = fixture(1000).await;
        let now = Timestamp::now();
        seed(
            f.db.as_ref(),
            &[
                ("old", 10, now.saturating_sub(HOUR)),
                ("soon", 10, now.saturating_add(Duration::from_secs(5))),
                ("fresh", 10, now.saturating_add(HOUR)),
            ],
        )
        .await;

        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(report.retained, 1);
        assert_eq!(keys(f.db.as_ref()).await, vec!["fresh"]);

        let stats = f.estimator.lock().unwrap().stats();
        assert_eq!(stats.guess, 10.0);
        assert_eq!(stats.error_bar, 0.0);
        assert!(f.engine.last_sweep().is_some());
    }

    #[tokio::test]
    async fn evicts_soonest_expiring_to_free_requested_space() {
        let f = fixture(1000).await;
        let now = Timestamp::now();
        let entries: Vec<(String, u64, Timestamp)> = (1..=4)
            .map(|i| (format!("e{i}"), 200, now.saturating_add(HOUR * i)))
            .collect();
        let refs: Vec<(&str, u64, Timestamp)> =
            entries.iter().map(|(k, s, e)| (k.as_str(), *s, *e)).collect();
        seed(f.db.as_ref(), &refs).await;
        f.estimator.lock().unwrap().set_size(800.0, 4);

        // guess 800 is 100 over the low mark; plus 200 requested.
        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 200.0).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.removed_size, 400.0);
        assert_eq!(keys(f.db.as_ref()).await, vec!["e3", "e4"]);
        assert_eq!(f.estimator.lock().unwrap().guess(), 400.0);
    }

    #[tokio::test]
    async fn second_sweep_within_interval_is_debounced() {
        let f = fixture(1000).await;
        let stats = f.backend.stats();

        let first = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert!(!first.skipped);
        // One walk over the index, one over the primary keys.
        assert_eq!(stats.cursors(), 2);

        let second = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.passes, 0);
        assert_eq!(stats.cursors(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sweeps_run_one_pass() {
        let f = Arc::new(fixture(1000).await);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                tokio::spawn(async move {
                    f.engine
                        .sweep(f.db.as_ref(), &f.estimator, 0.0)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ran = 0;
        for handle in handles {
            if !handle.await.unwrap().skipped {
                ran += 1;
            }
        }
        assert_eq!(ran, 1);
        assert_eq!(f.backend.stats().cursors(), 2);
    }

    #[tokio::test]
    async fn over_high_mark_is_never_debounced() {
        let f = fixture(1000).await;
        f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        f.estimator.lock().unwrap().update_size(950.0, 0.0);

        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.passes, 1);
    }

    #[tokio::test]
    async fn underestimated_store_triggers_one_more_pass() {
        let f = fixture(1000).await;
        let now = Timestamp::now();
        let entries: Vec<(String, u64, Timestamp)> = (1..=5)
            .map(|i| (format!("e{i}"), 190, now.saturating_add(HOUR * i)))
            .collect();
        let refs: Vec<(&str, u64, Timestamp)> =
            entries.iter().map(|(k, s, e)| (k.as_str(), *s, *e)).collect();
        seed(f.db.as_ref(), &refs).await;

        // The estimator believes the store is empty, so the first pass only
        // counts. Its reconciled total (950) is over the high mark.
        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(f.backend.stats().cursors(), 4);
        // Second pass frees 950 - 700 = 250, i.e. two entries.
        assert_eq!(report.removed, 2);
        assert_eq!(report.retained_size, 570.0);
        assert_eq!(keys(f.db.as_ref()).await, vec!["e3", "e4", "e5"]);
        assert_eq!(f.estimator.lock().unwrap().stats().mistakes.count, 2);
    }

    #[tokio::test]
    async fn malformed_records_are_removed() {
        let f = fixture(1000).await;
        let mut tx = f.db.begin(&[ENTRIES_TABLE], TxMode::ReadWrite).unwrap();
        tx.put(ENTRIES_TABLE, json!({"key": "junk", "expires": 1}))
            .await
            .unwrap();
        assert!(tx.commit().await.is_complete());

        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert_eq!(report.retained, 0);
        assert!(keys(f.db.as_ref()).await.is_empty());
    }

    #[tokio::test]
    async fn records_without_expiration_are_removed() {
        let f = fixture(1000).await;
        let now = Timestamp::now();
        seed(f.db.as_ref(), &[("kept", 10, now.saturating_add(HOUR))]).await;
        let mut tx = f.db.begin(&[ENTRIES_TABLE], TxMode::ReadWrite).unwrap();
        tx.put(ENTRIES_TABLE, json!({"key": "junk", "value": 1, "size": 5}))
            .await
            .unwrap();
        tx.put(ENTRIES_TABLE, json!({"key": "odd", "expires": null}))
            .await
            .unwrap();
        assert!(tx.commit().await.is_complete());

        let report = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.removed, 0);

        let mut tx = f.db.begin(&[ENTRIES_TABLE], TxMode::ReadOnly).unwrap();
        let remaining: Vec<String> = tx
            .open_cursor(ENTRIES_TABLE, None)
            .await
            .unwrap()
            .map(|r| r["key"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(remaining, vec!["kept"]);
    }

    #[tokio::test]
    async fn aborted_pass_leaves_store_untouched() {
        let f = fixture(1000).await;
        let now = Timestamp::now();
        seed(f.db.as_ref(), &[("old", 10, now.saturating_sub(HOUR))]).await;
        f.backend.abort_next_commit("busy");

        let err = f.engine.sweep(f.db.as_ref(), &f.estimator, 0.0).await.unwrap_err();
        assert_eq!(err.to_string(), "sweep failed: transaction aborted: busy");
        assert_eq!(keys(f.db.as_ref()).await, vec!["old"]);
    }
}
