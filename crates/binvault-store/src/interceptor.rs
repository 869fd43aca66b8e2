//! Decorators composed around a backend store.
//!
//! [`MeteredBlobStore`] records operation counters; [`FreezeGuardedBlobStore`]
//! rejects mutations during a maintenance freeze. Both implement
//! [`BlobStore`] themselves and pass results and errors through unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::blob::{Blob, BlobHeaders, BlobId, BlobRecord};
use crate::cancel::CancelToken;
use crate::error::StoreResult;
use crate::freeze::FreezeService;
use crate::metrics::{
    BlobStoreMetrics, OperationMetricsSnapshot, OperationType, StoreOperationMetrics,
};
use crate::soft_delete::SoftDeletedBlobIndex;
use crate::store::{BlobStore, BlobStoreType, CompactionStats, ReclaimOutcome};

/// Records per-operation counters around an inner store.
pub struct MeteredBlobStore<S> {
    inner: S,
    metrics: Arc<StoreOperationMetrics>,
}

impl<S: BlobStore> MeteredBlobStore<S> {
    /// Wraps `inner`, recording into `metrics`.
    pub fn new(inner: S, metrics: Arc<StoreOperationMetrics>) -> Self {
        Self { inner, metrics }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn timed<T>(
        &self,
        op: OperationType,
        bytes_of: impl FnOnce(&T) -> u64,
        call: impl FnOnce() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let started = Instant::now();
        let result = call();
        let counters = self.metrics.get(op);
        match &result {
            Ok(value) => counters.record_success(started.elapsed(), bytes_of(value)),
            Err(_) => counters.record_error(),
        }
        result
    }
}

impl<S: BlobStore> BlobStore for MeteredBlobStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn store_type(&self) -> BlobStoreType {
        self.inner.store_type()
    }

    fn start(&self) -> StoreResult<()> {
        self.inner.start()
    }

    fn stop(&self) -> StoreResult<()> {
        self.inner.stop()
    }

    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.timed(
            OperationType::Upload,
            |r: &BlobRecord| r.size,
            || self.inner.create(payload, headers),
        )
    }

    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.timed(
            OperationType::Upload,
            |r: &BlobRecord| r.size,
            || self.inner.copy(blob_id, headers),
        )
    }

    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob> {
        self.timed(
            OperationType::Download,
            |b: &Blob| b.content.len() as u64,
            || self.inner.get(blob_id),
        )
    }

    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.inner.exists(blob_id)
    }

    fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> StoreResult<bool> {
        self.timed(OperationType::Delete, |_| 0, || {
            self.inner.soft_delete(blob_id, reason)
        })
    }

    fn undelete(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.inner.undelete(blob_id)
    }

    fn delete_hard(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.timed(OperationType::Delete, |_| 0, || self.inner.delete_hard(blob_id))
    }

    fn reclaim(&self, blob_id: &BlobId, retention: Duration) -> StoreResult<ReclaimOutcome> {
        self.inner.reclaim(blob_id, retention)
    }

    fn compact(&self, cancel: &CancelToken) -> StoreResult<CompactionStats> {
        self.inner.compact(cancel)
    }

    fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        self.inner.blob_ids()
    }

    fn metrics(&self) -> BlobStoreMetrics {
        self.inner.metrics()
    }

    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics> {
        let metrics = self.inner.recalculate_metrics()?;
        self.metrics.reset();
        Ok(metrics)
    }

    fn operation_metrics(&self) -> Vec<(OperationType, OperationMetricsSnapshot)> {
        self.metrics.snapshot()
    }

    fn soft_delete_index(&self) -> Option<&SoftDeletedBlobIndex> {
        self.inner.soft_delete_index()
    }

    fn soft_delete_retention(&self) -> Duration {
        self.inner.soft_delete_retention()
    }

    fn members(&self) -> Vec<String> {
        self.inner.members()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn remove(&self) -> StoreResult<()> {
        self.inner.remove()
    }
}

/// Consults a [`FreezeService`] before delegating.
pub struct FreezeGuardedBlobStore<S> {
    inner: S,
    freeze: Arc<dyn FreezeService>,
}

impl<S: BlobStore> FreezeGuardedBlobStore<S> {
    /// Wraps `inner`, gated by `freeze`.
    pub fn new(inner: S, freeze: Arc<dyn FreezeService>) -> Self {
        Self { inner, freeze }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: BlobStore> BlobStore for FreezeGuardedBlobStore<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn store_type(&self) -> BlobStoreType {
        self.inner.store_type()
    }

    fn start(&self) -> StoreResult<()> {
        self.inner.start()
    }

    fn stop(&self) -> StoreResult<()> {
        self.inner.stop()
    }

    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.freeze.check_writable("create blob")?;
        self.inner.create(payload, headers)
    }

    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.freeze.check_writable("copy blob")?;
        self.inner.copy(blob_id, headers)
    }

    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob> {
        self.freeze.check_readable("get blob")?;
        self.inner.get(blob_id)
    }

    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.freeze.check_readable("check blob")?;
        self.inner.exists(blob_id)
    }

    fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> StoreResult<bool> {
        self.freeze.check_writable("delete blob")?;
        self.inner.soft_delete(blob_id, reason)
    }

    fn undelete(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.freeze.check_writable("undelete blob")?;
        self.inner.undelete(blob_id)
    }

    fn delete_hard(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.freeze.check_writable("hard delete blob")?;
        self.inner.delete_hard(blob_id)
    }

    fn reclaim(&self, blob_id: &BlobId, retention: Duration) -> StoreResult<ReclaimOutcome> {
        self.freeze.check_writable("reclaim blob")?;
        self.inner.reclaim(blob_id, retention)
    }

    fn compact(&self, cancel: &CancelToken) -> StoreResult<CompactionStats> {
        self.freeze.check_writable("compact store")?;
        self.inner.compact(cancel)
    }

    fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        self.inner.blob_ids()
    }

    fn metrics(&self) -> BlobStoreMetrics {
        self.inner.metrics()
    }

    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics> {
        self.inner.recalculate_metrics()
    }

    fn operation_metrics(&self) -> Vec<(OperationType, OperationMetricsSnapshot)> {
        self.inner.operation_metrics()
    }

    fn soft_delete_index(&self) -> Option<&SoftDeletedBlobIndex> {
        self.inner.soft_delete_index()
    }

    fn soft_delete_retention(&self) -> Duration {
        self.inner.soft_delete_retention()
    }

    fn members(&self) -> Vec<String> {
        self.inner.members()
    }

    fn is_writable(&self) -> bool {
        !self.freeze.is_frozen() && self.inner.is_writable()
    }

    fn remove(&self) -> StoreResult<()> {
        self.freeze.check_writable("remove store")?;
        self.inner.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BLOB_NAME_HEADER, CREATED_BY_HEADER};
    use crate::error::StoreError;
    use crate::file_store::{FileBlobStore, FileBlobStoreConfig, PATH_ATTR};
    use crate::freeze::LocalFreezeService;
    use crate::soft_delete::{InMemorySoftDeletedBlobDao, SoftDeleteIndexConfig};
    use crate::store::BlobStoreConfiguration;
    use tempfile::TempDir;

    fn headers() -> BlobHeaders {
        let mut h = BlobHeaders::new();
        h.insert(BLOB_NAME_HEADER.to_string(), "a".to_string());
        h.insert(CREATED_BY_HEADER.to_string(), "tester".to_string());
        h
    }

    fn file_store(dir: &TempDir) -> FileBlobStore {
        let configuration =
            BlobStoreConfiguration::new("m", BlobStoreType::File).with_attribute(PATH_ATTR, "m");
        let config = FileBlobStoreConfig::from_configuration(&configuration, dir.path()).unwrap();
        let store = FileBlobStore::new(
            &configuration,
            config,
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        store.start().unwrap();
        store
    }

    #[test]
    fn test_success_counts_bytes_and_time() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(StoreOperationMetrics::default());
        let store = MeteredBlobStore::new(file_store(&dir), metrics.clone());

        let record = store.create(Bytes::from_static(b"12345"), headers()).unwrap();
        store.get(&record.blob_id).unwrap();
        store.get(&record.blob_id).unwrap();

        let upload = metrics.snapshot_of(OperationType::Upload);
        assert_eq!(upload.successful_requests, 1);
        assert_eq!(upload.bytes_on_requests, 5);
        let download = metrics.snapshot_of(OperationType::Download);
        assert_eq!(download.successful_requests, 2);
        assert_eq!(download.bytes_on_requests, 10);
        assert_eq!(metrics.snapshot_of(OperationType::Delete), Default::default());
    }

    #[test]
    fn test_error_is_counted_and_passed_through() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(StoreOperationMetrics::default());
        let store = MeteredBlobStore::new(file_store(&dir), metrics.clone());
        let missing = BlobId::generate();

        let err = store.get(&missing).unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound { ref blob_id } if *blob_id == missing));
        let download = metrics.snapshot_of(OperationType::Download);
        assert_eq!(download.error_requests, 1);
        assert_eq!(download.successful_requests, 0);
    }

    #[test]
    fn test_recalculate_resets_counters() {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(StoreOperationMetrics::default());
        let store = MeteredBlobStore::new(file_store(&dir), metrics.clone());
        let record = store.create(Bytes::from_static(b"x"), headers()).unwrap();
        store.soft_delete(&record.blob_id, "gone").unwrap();
        assert_eq!(store.operation_metrics().len(), 2);

        let sizes = store.recalculate_metrics().unwrap();
        assert_eq!(sizes.blob_count, 1);
        assert!(store
            .operation_metrics()
            .iter()
            .all(|(_, s)| s.successful_requests == 0));
    }

    #[test]
    fn test_freeze_rejects_mutations_but_not_reads() {
        let dir = TempDir::new().unwrap();
        let freeze = Arc::new(LocalFreezeService::new());
        let store = FreezeGuardedBlobStore::new(file_store(&dir), freeze.clone());
        let record = store.create(Bytes::from_static(b"x"), headers()).unwrap();

        freeze.freeze("upgrade");
        assert!(!store.is_writable());
        assert!(matches!(
            store.create(Bytes::from_static(b"y"), headers()),
            Err(StoreError::Frozen { .. })
        ));
        assert!(matches!(
            store.soft_delete(&record.blob_id, "x"),
            Err(StoreError::Frozen { .. })
        ));
        assert!(store.get(&record.blob_id).is_ok());
        assert_eq!(store.blob_ids().unwrap().len(), 1);

        freeze.release();
        assert!(store.soft_delete(&record.blob_id, "x").unwrap());
    }
}
