//! Concrete maintenance tasks.
//!
//! All three skip group stores: groups fan out to their members, and
//! members are selected on their own, so each store has one reclaimer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::blob::BlobId;
use crate::cancel::CancelToken;
use crate::error::StoreResult;
use crate::metrics::BlobStoreMetrics;
use crate::store::{BlobStore, BlobStoreType, CompactionStats};
use crate::task::{JobStream, MaintenanceTask, Unit};

fn is_leaf(store: &dyn BlobStore) -> bool {
    store.store_type() != BlobStoreType::Group && store.soft_delete_index().is_some()
}

/// Runs each store's own compaction as one unit.
#[derive(Default)]
pub struct CompactBlobStoreTask {
    stats: Arc<Mutex<BTreeMap<String, CompactionStats>>>,
}

impl CompactBlobStoreTask {
    /// Creates the task.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MaintenanceTask for CompactBlobStoreTask {
    type Output = BTreeMap<String, CompactionStats>;

    fn name(&self) -> &str {
        "compact"
    }

    fn applies_to(&self, store: &dyn BlobStore) -> bool {
        is_leaf(store)
    }

    fn job_stream(
        &self,
        store: Arc<dyn BlobStore>,
        cancel: &CancelToken,
    ) -> StoreResult<JobStream> {
        let stats = self.stats.clone();
        let cancel = cancel.clone();
        let unit: Unit = Box::new(move || {
            let result = store.compact(&cancel)?;
            stats
                .lock()
                .entry(store.name().to_string())
                .or_default()
                .merge(&result);
            Ok(())
        });
        Ok(Box::new(std::iter::once(unit)))
    }

    fn result(&self) -> Self::Output {
        self.stats.lock().clone()
    }
}

/// Reclaims soft-deleted blobs, one unit per pending record.
///
/// Records still inside their retention window are left for a later run.
pub struct PurgeSoftDeletedBlobsTask {
    retention_override: Option<Duration>,
    stats: Arc<Mutex<CompactionStats>>,
}

impl PurgeSoftDeletedBlobsTask {
    /// Uses each store's configured retention.
    pub fn new() -> Self {
        Self {
            retention_override: None,
            stats: Arc::new(Mutex::new(CompactionStats::default())),
        }
    }

    /// Uses `retention` for every store instead.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            retention_override: Some(retention),
            ..Self::new()
        }
    }
}

impl Default for PurgeSoftDeletedBlobsTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Walks one pass of a store's soft-delete index.
struct PendingRecords {
    store: Arc<dyn BlobStore>,
    retention: Duration,
    stats: Arc<Mutex<CompactionStats>>,
    done: bool,
}

impl PendingRecords {
    fn unit(&self, blob_id: BlobId) -> Unit {
        let store = self.store.clone();
        let stats = self.stats.clone();
        let retention = self.retention;
        Box::new(move || {
            let outcome = store.reclaim(&blob_id, retention)?;
            stats.lock().record(outcome);
            Ok(())
        })
    }
}

impl Iterator for PendingRecords {
    type Item = Unit;

    fn next(&mut self) -> Option<Unit> {
        if self.done {
            return None;
        }
        let next = match self.store.soft_delete_index() {
            Some(index) => index.get_next_available_record(),
            None => Ok(None),
        };
        match next {
            Ok(Some(blob_id)) => Some(self.unit(blob_id)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                warn!(
                    "Stopping purge of '{}' after index read failure: {}",
                    self.store.name(),
                    err
                );
                self.done = true;
                None
            }
        }
    }
}

impl MaintenanceTask for PurgeSoftDeletedBlobsTask {
    type Output = CompactionStats;

    fn name(&self) -> &str {
        "purge-soft-deleted"
    }

    fn applies_to(&self, store: &dyn BlobStore) -> bool {
        is_leaf(store)
    }

    fn job_stream(
        &self,
        store: Arc<dyn BlobStore>,
        _cancel: &CancelToken,
    ) -> StoreResult<JobStream> {
        let retention = self
            .retention_override
            .unwrap_or_else(|| store.soft_delete_retention());
        debug!(
            "Purging '{}' with retention {}s",
            store.name(),
            retention.as_secs()
        );
        Ok(Box::new(PendingRecords {
            store,
            retention,
            stats: self.stats.clone(),
            done: false,
        }))
    }

    fn result(&self) -> CompactionStats {
        *self.stats.lock()
    }
}

/// Recounts size metrics, one unit per store.
#[derive(Default)]
pub struct RecalculateMetricsTask {
    results: Arc<Mutex<BTreeMap<String, BlobStoreMetrics>>>,
}

impl RecalculateMetricsTask {
    /// Creates the task.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MaintenanceTask for RecalculateMetricsTask {
    type Output = BTreeMap<String, BlobStoreMetrics>;

    fn name(&self) -> &str {
        "recalculate-metrics"
    }

    fn applies_to(&self, store: &dyn BlobStore) -> bool {
        store.store_type() != BlobStoreType::Group
    }

    fn job_stream(
        &self,
        store: Arc<dyn BlobStore>,
        _cancel: &CancelToken,
    ) -> StoreResult<JobStream> {
        let results = self.results.clone();
        let unit: Unit = Box::new(move || {
            let metrics = store.recalculate_metrics()?;
            results.lock().insert(store.name().to_string(), metrics);
            Ok(())
        });
        Ok(Box::new(std::iter::once(unit)))
    }

    fn result(&self) -> Self::Output {
        self.results.lock().clone()
    }
}
