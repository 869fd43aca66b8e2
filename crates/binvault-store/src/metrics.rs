//! Per-store operation counters and store-level size metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind of store operation tracked by the metrics interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    /// Blob writes (create, copy).
    Upload,
    /// Blob reads.
    Download,
    /// Soft, hard and bulk deletes.
    Delete,
}

impl OperationType {
    /// All tracked operation types.
    pub const ALL: [OperationType; 3] = [
        OperationType::Upload,
        OperationType::Download,
        OperationType::Delete,
    ];

    /// Lowercase label used in logs and exports.
    pub fn label(&self) -> &'static str {
        match self {
            OperationType::Upload => "upload",
            OperationType::Download => "download",
            OperationType::Delete => "delete",
        }
    }
}

/// Concurrent counters for one operation type.
#[derive(Debug, Default)]
pub struct OperationMetrics {
    successful_requests: AtomicU64,
    error_requests: AtomicU64,
    time_on_requests_us: AtomicU64,
    bytes_on_requests: AtomicU64,
}

impl OperationMetrics {
    /// Records a successful call.
    pub fn record_success(&self, elapsed: Duration, bytes: u64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.time_on_requests_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.bytes_on_requests.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a failed call.
    pub fn record_error(&self) {
        self.error_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> OperationMetricsSnapshot {
        OperationMetricsSnapshot {
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            error_requests: self.error_requests.load(Ordering::Relaxed),
            time_on_requests_us: self.time_on_requests_us.load(Ordering::Relaxed),
            bytes_on_requests: self.bytes_on_requests.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.successful_requests.store(0, Ordering::Relaxed);
        self.error_requests.store(0, Ordering::Relaxed);
        self.time_on_requests_us.store(0, Ordering::Relaxed);
        self.bytes_on_requests.store(0, Ordering::Relaxed);
    }
}

/// Copy of [`OperationMetrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetricsSnapshot {
    /// Calls that completed successfully.
    pub successful_requests: u64,
    /// Calls that returned an error.
    pub error_requests: u64,
    /// Cumulative time spent in successful calls, in microseconds.
    pub time_on_requests_us: u64,
    /// Cumulative payload bytes moved by successful calls.
    pub bytes_on_requests: u64,
}

/// Operation counters for one store, one entry per operation type.
#[derive(Debug, Default)]
pub struct StoreOperationMetrics {
    by_type: DashMap<OperationType, Arc<OperationMetrics>>,
}

impl StoreOperationMetrics {
    /// Counters for `op`, created on first use.
    pub fn get(&self, op: OperationType) -> Arc<OperationMetrics> {
        self.by_type.entry(op).or_default().clone()
    }

    /// Snapshot of every operation type seen so far.
    pub fn snapshot(&self) -> Vec<(OperationType, OperationMetricsSnapshot)> {
        let mut out: Vec<_> = self
            .by_type
            .iter()
            .map(|e| (*e.key(), e.value().snapshot()))
            .collect();
        out.sort_by_key(|(op, _)| *op);
        out
    }

    /// Snapshot for a single type; zeros if the type was never used.
    pub fn snapshot_of(&self, op: OperationType) -> OperationMetricsSnapshot {
        self.by_type
            .get(&op)
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        for entry in self.by_type.iter() {
            entry.value().reset();
        }
    }
}

/// Registry handing out operation counters per store name.
///
/// Passed explicitly to whoever builds stores; there is no global instance.
#[derive(Debug, Default)]
pub struct OperationMetricsRegistry {
    stores: DashMap<String, Arc<StoreOperationMetrics>>,
}

impl OperationMetricsRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `store`, created on first use.
    pub fn for_store(&self, store: &str) -> Arc<StoreOperationMetrics> {
        self.stores
            .entry(store.to_string())
            .or_default()
            .clone()
    }

    /// Drops the counters of a deleted store.
    pub fn remove(&self, store: &str) {
        if self.stores.remove(store).is_some() {
            debug!("Removed operation metrics for store '{}'", store);
        }
    }

    /// Names of stores that have counters.
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Size metrics for one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreMetrics {
    /// Number of live and soft-deleted blobs not yet reclaimed.
    pub blob_count: u64,
    /// Total payload bytes of those blobs.
    pub total_size: u64,
    /// Bytes available to the store, if known.
    pub available_space: u64,
    /// Whether the backend has no practical capacity limit.
    pub unlimited: bool,
}

impl BlobStoreMetrics {
    /// Adds another store's metrics into this one.
    pub fn merge(&mut self, other: &BlobStoreMetrics) {
        self.blob_count += other.blob_count;
        self.total_size += other.total_size;
        self.available_space = self.available_space.saturating_add(other.available_space);
        self.unlimited |= other.unlimited;
    }
}

/// Atomic running totals backing [`BlobStoreMetrics`].
#[derive(Debug, Default)]
pub struct BlobStoreMetricsTracker {
    blob_count: AtomicU64,
    total_size: AtomicU64,
}

impl BlobStoreMetricsTracker {
    /// Records a written blob.
    pub fn record_added(&self, size: u64) {
        self.blob_count.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Records a reclaimed blob.
    pub fn record_removed(&self, size: u64) {
        let _ = self
            .blob_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1)));
        let _ = self
            .total_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(s.saturating_sub(size)));
    }

    /// Replaces the totals after a full recount.
    pub fn replace(&self, blob_count: u64, total_size: u64) {
        self.blob_count.store(blob_count, Ordering::Relaxed);
        self.total_size.store(total_size, Ordering::Relaxed);
    }

    /// Current blob count.
    pub fn blob_count(&self) -> u64 {
        self.blob_count.load(Ordering::Relaxed)
    }

    /// Current total size.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_record_success_accumulates() {
        let m = OperationMetrics::default();
        m.record_success(Duration::from_micros(10), 100);
        m.record_success(Duration::from_micros(5), 20);
        let snap = m.snapshot();
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.time_on_requests_us, 15);
        assert_eq!(snap.bytes_on_requests, 120);
        assert_eq!(snap.error_requests, 0);
    }

    #[test]
    fn test_lazy_creation_per_type() {
        let store = StoreOperationMetrics::default();
        assert!(store.snapshot().is_empty());
        store.get(OperationType::Delete).record_error();
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, OperationType::Delete);
        assert_eq!(store.snapshot_of(OperationType::Upload), OperationMetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(StoreOperationMetrics::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        store
                            .get(OperationType::Upload)
                            .record_success(Duration::from_micros(1), 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = store.snapshot_of(OperationType::Upload);
        assert_eq!(snap.successful_requests, 8000);
        assert_eq!(snap.bytes_on_requests, 8000);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let store = StoreOperationMetrics::default();
        store.get(OperationType::Download).record_success(Duration::from_millis(1), 9);
        store.reset();
        assert_eq!(
            store.snapshot_of(OperationType::Download),
            OperationMetricsSnapshot::default()
        );
    }

    #[test]
    fn test_registry_is_per_store() {
        let registry = OperationMetricsRegistry::new();
        registry.for_store("a").get(OperationType::Upload).record_error();
        assert_eq!(
            registry.for_store("b").snapshot_of(OperationType::Upload).error_requests,
            0
        );
        assert_eq!(registry.store_names(), vec!["a".to_string(), "b".to_string()]);
        registry.remove("a");
        assert_eq!(registry.store_names(), vec!["b".to_string()]);
    }

    #[test]
    fn test_tracker_never_underflows() {
        let tracker = BlobStoreMetricsTracker::default();
        tracker.record_added(10);
        tracker.record_removed(25);
        tracker.record_removed(1);
        assert_eq!(tracker.blob_count(), 0);
        assert_eq!(tracker.total_size(), 0);
    }

    #[test]
    fn test_merge_metrics() {
        let mut a = BlobStoreMetrics {
            blob_count: 1,
            total_size: 10,
            available_space: 100,
            unlimited: false,
        };
        a.merge(&BlobStoreMetrics {
            blob_count: 2,
            total_size: 5,
            available_space: u64::MAX,
            unlimited: true,
        });
        assert_eq!(a.blob_count, 3);
        assert_eq!(a.total_size, 15);
        assert_eq!(a.available_space, u64::MAX);
        assert!(a.unlimited);
    }
}
