use stash_store::{Database, StoreResult, Transaction, TxMode, TxOutcome};
use tracing::debug;

use crate::entry::{CachedItem, StoredEntry, ENTRIES_TABLE, EXPIRES_INDEX};
use crate::error::{aborted, AdapterError, AdapterResult, TxState};

/// One logical adapter operation bound to one backend transaction.
///
/// The body runs against [`OpTransaction::tx`]; [`OpTransaction::finish`]
/// then commits on success or aborts on failure and maps the outcome to a
/// single result.
pub(crate) struct OpTransaction {
    operation: &'static str,
    tx: Box<dyn Transaction>,
}

impl OpTransaction {
    pub fn begin(db: &dyn Database, operation: &'static str, mode: TxMode) -> AdapterResult<Self> {
        let tx = db
            .begin(&[ENTRIES_TABLE], mode)
            .map_err(|e| AdapterError::transaction(operation, TxState::NotStarted, e.to_string()))?;
        Ok(Self { operation, tx })
    }

    pub fn tx(&mut self) -> &mut dyn Transaction {
        self.tx.as_mut()
    }

    pub async fn finish<T>(self, body: StoreResult<T>) -> AdapterResult<T> {
        let value = match body {
            Ok(value) => value,
            Err(e) => {
                self.tx.abort(&e.to_string());
                return Err(aborted(self.operation, &e));
            }
        };
        match self.tx.commit().await {
            TxOutcome::Complete => Ok(value),
            TxOutcome::Abort(reason) => Err(AdapterError::transaction(
                self.operation,
                TxState::Aborted,
                reason,
            )),
            TxOutcome::Error(reason) => Err(AdapterError::transaction(
                self.operation,
                TxState::Errored,
                reason,
            )),
        }
    }
}

/// Totals from a full scan of the entries table.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    pub items: Vec<CachedItem>,
    pub size: f64,
    pub count: u64,
}

/// Walk every entry in expiration order, summing stored sizes and, when
/// `collect` is set, gathering the entries themselves.
pub(crate) async fn scan_entries(
    db: &dyn Database,
    operation: &'static str,
    collect: bool,
) -> AdapterResult<ScanOutcome> {
    let mut op = OpTransaction::begin(db, operation, TxMode::ReadOnly)?;
    let body: StoreResult<Vec<_>> = async {
        let cursor = op.tx().open_cursor(ENTRIES_TABLE, Some(EXPIRES_INDEX)).await?;
        Ok(cursor.collect())
    }
    .await;
    let records = op.finish(body).await?;

    let mut outcome = ScanOutcome::default();
    for record in records {
        let entry = StoredEntry::from_record(record)?;
        outcome.size += entry.size as f64;
        outcome.count += 1;
        if collect {
            outcome.items.push(entry.into_item());
        }
    }
    debug!(operation, size = outcome.size, count = outcome.count, "scan complete");
    Ok(outcome)
}
