//! Persistence service for grouped transactions.
//!
//! Each emitted group is written as one batch on a background task so a slow
//! or failing store never holds up ingestion. Transient store failures are
//! retried with exponential backoff for a bounded time; anything else is
//! counted and logged. At shutdown `drain` waits, bounded, for writes still in
//! flight.

use crate::sync::repositories::{StoreError, TransferRow, TransferStore};
use crate::transfer::{GroupSink, GroupedTransaction};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Retry settings for a single batch write.
#[derive(Debug, Clone)]
pub struct WriteRetry {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up on a batch after this long.
    pub max_elapsed: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl WriteRetry {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build()
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches_written: AtomicU64,
    rows_inserted: AtomicU64,
    rows_ignored: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of the persistence counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStats {
    pub batches_written: u64,
    pub rows_inserted: u64,
    /// Rows whose key was already stored, e.g. after a replay.
    pub rows_ignored: u64,
    pub failures: u64,
    pub in_flight: usize,
}

/// Service for writing grouped transactions to a [`TransferStore`].
///
/// Cheap to clone; clones share the store, the counters and the set of
/// in-flight writes.
#[derive(Clone)]
pub struct PersistenceService {
    store: Arc<dyn TransferStore>,
    retry: WriteRetry,
    tasks: TaskTracker,
    counters: Arc<Counters>,
}

impl PersistenceService {
    pub fn new(store: Arc<dyn TransferStore>, retry: WriteRetry) -> Self {
        Self {
            store,
            retry,
            tasks: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start writing `group` in the background and return immediately.
    pub fn persist(&self, group: &GroupedTransaction) {
        if self.tasks.is_closed() {
            warn!(
                "Persistence is draining, dropping write for transaction {}",
                group.transaction_id
            );
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let rows = TransferRow::from_group(group);
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let retry = self.retry.clone();
        let transaction_id = group.transaction_id;

        self.tasks.spawn(async move {
            match write_with_retry(store, &rows, &retry).await {
                Ok(inserted) => {
                    counters.batches_written.fetch_add(1, Ordering::Relaxed);
                    counters
                        .rows_inserted
                        .fetch_add(inserted as u64, Ordering::Relaxed);
                    counters
                        .rows_ignored
                        .fetch_add((rows.len() - inserted.min(rows.len())) as u64, Ordering::Relaxed);
                    debug!(
                        "Persisted transaction {} ({} of {} rows new)",
                        transaction_id,
                        inserted,
                        rows.len()
                    );
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to persist transaction {}: {}", transaction_id, e);
                }
            }
        });
    }

    /// Stop accepting writes and wait up to `timeout` for in-flight ones.
    ///
    /// Returns true if everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        let pending = self.tasks.len();
        if pending > 0 {
            info!("Waiting for {} in-flight persistence writes", pending);
        }

        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} persistence writes still in flight after {:?}",
                    self.tasks.len(),
                    timeout
                );
                false
            }
        }
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            batches_written: self.counters.batches_written.load(Ordering::Relaxed),
            rows_inserted: self.counters.rows_inserted.load(Ordering::Relaxed),
            rows_ignored: self.counters.rows_ignored.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            in_flight: self.tasks.len(),
        }
    }
}

async fn write_with_retry(
    store: Arc<dyn TransferStore>,
    rows: &[TransferRow],
    retry: &WriteRetry,
) -> Result<usize, StoreError> {
    backoff::future::retry(retry.backoff(), || {
        let store = Arc::clone(&store);
        async move {
            store.upsert_transfers(rows).await.map_err(|e| {
                if e.is_transient() {
                    warn!("Transient persistence failure, retrying: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}

impl GroupSink for PersistenceService {
    fn on_group(&mut self, group: &GroupedTransaction) {
        self.persist(group);
    }

    fn name(&self) -> &'static str {
        "PersistenceService"
    }
}
