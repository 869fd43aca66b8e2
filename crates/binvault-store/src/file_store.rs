//! Blob store on the local filesystem.
//!
//! Files are written under `tmp/` and renamed into the date-partitioned
//! content tree, payload first and record last. A blob exists once its
//! `.properties` file does. Size metrics are kept in memory and persisted to
//! `metrics.json` on stop.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{sha256_hex, validate_headers, Blob, BlobHeaders, BlobId, BlobRecord};
use crate::cancel::CancelToken;
use crate::error::{StoreError, StoreResult};
use crate::layout::{bytes_path, properties_path, CONTENT_DIR, TEMP_DIR};
use crate::metrics::{BlobStoreMetrics, BlobStoreMetricsTracker};
use crate::soft_delete::{SoftDeleteIndexConfig, SoftDeletedBlobDao, SoftDeletedBlobIndex};
use crate::store::{
    BlobStore, BlobStoreConfiguration, BlobStoreQuota, BlobStoreType, CompactionStats,
    ReclaimOutcome,
};
use crate::walker::DateBasedWalker;

/// Attribute holding the store directory, absolute or relative to the blob root.
pub const PATH_ATTR: &str = "path";
/// Attribute capping the bytes the store may hold.
pub const CAPACITY_ATTR: &str = "capacity_bytes";
/// File holding persisted size metrics.
pub const METRICS_FILE: &str = "metrics.json";

const DEFAULT_ORPHAN_TMP_AGE_SECS: u64 = 3600;

/// Settings of a filesystem store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBlobStoreConfig {
    /// Store directory.
    pub root: PathBuf,
    /// Capacity in bytes; `None` means unlimited.
    pub capacity: Option<u64>,
    /// fsync files before renaming them into place.
    pub sync_writes: bool,
    /// Temporary files older than this are removed by compaction (default: 3600).
    pub orphan_tmp_age_secs: u64,
}

impl Default for FileBlobStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("default"),
            capacity: None,
            sync_writes: true,
            orphan_tmp_age_secs: DEFAULT_ORPHAN_TMP_AGE_SECS,
        }
    }
}

impl FileBlobStoreConfig {
    /// Reads the settings from a store configuration, resolving a relative
    /// `path` against `base_dir`.
    pub fn from_configuration(config: &BlobStoreConfiguration, base_dir: &Path) -> StoreResult<Self> {
        let path = PathBuf::from(config.required_attribute(PATH_ATTR)?.trim());
        let root = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        let capacity = match config.attribute(CAPACITY_ATTR) {
            Some(_) => Some(config.u64_attribute(CAPACITY_ATTR, 0)?),
            None => None,
        };
        Ok(Self {
            root,
            capacity,
            ..Self::default()
        })
    }
}

/// Blob store over a local directory.
pub struct FileBlobStore {
    name: String,
    config: FileBlobStoreConfig,
    index: SoftDeletedBlobIndex,
    sizes: BlobStoreMetricsTracker,
    quota: Option<BlobStoreQuota>,
    retention: Duration,
    started: AtomicBool,
    record_lock: Mutex<()>,
}

impl FileBlobStore {
    /// Creates the store and binds its soft-delete index.
    pub fn new(
        configuration: &BlobStoreConfiguration,
        config: FileBlobStoreConfig,
        dao: Arc<dyn SoftDeletedBlobDao>,
        index_config: SoftDeleteIndexConfig,
    ) -> StoreResult<Self> {
        let index = SoftDeletedBlobIndex::new(dao, index_config);
        index.init(&configuration.name)?;
        Ok(Self {
            name: configuration.name.clone(),
            config,
            index,
            sizes: BlobStoreMetricsTracker::default(),
            quota: configuration.quota,
            retention: configuration.soft_delete_retention()?,
            started: AtomicBool::new(false),
            record_lock: Mutex::new(()),
        })
    }

    /// Store directory.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    fn tmp_dir(&self) -> PathBuf {
        self.config.root.join(TEMP_DIR)
    }

    fn bytes_file(&self, blob_id: &BlobId) -> PathBuf {
        self.config.root.join(bytes_path(blob_id))
    }

    fn properties_file(&self, blob_id: &BlobId) -> PathBuf {
        self.config.root.join(properties_path(blob_id))
    }

    fn ensure_started(&self) -> StoreResult<()> {
        if !self.started.load(Ordering::Acquire) {
            return Err(StoreError::InvalidState {
                store: self.name.clone(),
                state: "not started".to_string(),
            });
        }
        Ok(())
    }

    fn write_atomic(&self, tmp: &Path, dest: &Path, data: &[u8]) -> io::Result<()> {
        {
            let mut file = File::create(tmp)?;
            file.write_all(data)?;
            if self.config.sync_writes {
                file.sync_all()?;
            }
        }
        fs::rename(tmp, dest)
    }

    fn read_record(&self, blob_id: &BlobId) -> StoreResult<Option<BlobRecord>> {
        let path = self.properties_file(blob_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let location = self.bytes_file(blob_id).to_string_lossy().into_owned();
        Ok(Some(BlobRecord::from_properties(
            blob_id.clone(),
            &location,
            &text,
        )?))
    }

    fn write_record(&self, record: &BlobRecord) -> StoreResult<()> {
        let tmp = self.tmp_dir().join(format!("{}.properties.tmp", record.blob_id));
        let result = self.write_atomic(
            &tmp,
            &self.properties_file(&record.blob_id),
            record.to_properties().as_bytes(),
        );
        if result.is_err() {
            remove_quietly(&tmp);
        }
        result.map_err(StoreError::from)
    }

    fn remove_files(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let record = remove_if_present(&self.properties_file(blob_id))?;
        let payload = remove_if_present(&self.bytes_file(blob_id))?;
        Ok(record || payload)
    }

    fn check_quota(&self, incoming: u64) -> StoreResult<()> {
        match &self.quota {
            Some(quota) => quota.check(&self.name, &self.metrics(), incoming),
            None => Ok(()),
        }
    }

    fn new_record(&self, size: u64, sha256: String, headers: BlobHeaders) -> BlobRecord {
        let now = Utc::now();
        let blob_id = BlobId::new(now);
        BlobRecord {
            location: self.bytes_file(&blob_id).to_string_lossy().into_owned(),
            blob_id,
            size,
            sha256,
            created_at: now,
            headers,
            deleted: false,
            deleted_reason: None,
            deleted_at: None,
        }
    }

    /// Places payload and record; on failure nothing of the blob remains.
    fn place(&self, record: &BlobRecord, payload: &[u8]) -> StoreResult<()> {
        let blob_id = &record.blob_id;
        let bytes_dest = self.bytes_file(blob_id);
        let props_dest = self.properties_file(blob_id);
        let tmp_bytes = self.tmp_dir().join(format!("{}.bytes.tmp", blob_id));
        let tmp_props = self.tmp_dir().join(format!("{}.properties.tmp", blob_id));

        let result = (|| -> io::Result<()> {
            if let Some(parent) = bytes_dest.parent() {
                fs::create_dir_all(parent)?;
            }
            self.write_atomic(&tmp_bytes, &bytes_dest, payload)?;
            self.write_atomic(&tmp_props, &props_dest, record.to_properties().as_bytes())
        })();
        if let Err(err) = result {
            warn!("Failed to write blob {} in '{}': {}", blob_id, self.name, err);
            for path in [&tmp_bytes, &tmp_props, &props_dest, &bytes_dest] {
                remove_quietly(path);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn load_persisted_metrics(&self) -> Option<BlobStoreMetrics> {
        let path = self.config.root.join(METRICS_FILE);
        let text = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<BlobStoreMetrics>(&text) {
            Ok(metrics) => Some(metrics),
            Err(err) => {
                warn!("Ignoring unreadable {}: {}", path.display(), err);
                None
            }
        }
    }

    fn persist_metrics(&self) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(&self.metrics())?;
        let tmp = self.tmp_dir().join(format!("{}.tmp", METRICS_FILE));
        self.write_atomic(&tmp, &self.config.root.join(METRICS_FILE), &json)?;
        Ok(())
    }

    /// Puts records still marked deleted back into the soft-delete index so
    /// compaction can reclaim them; returns how many were missing.
    fn reindex_soft_deleted(&self) -> StoreResult<u64> {
        let mut reindexed = 0u64;
        for blob_id in self.blob_ids()? {
            match self.read_record(&blob_id) {
                Ok(Some(record)) if record.deleted => {
                    if self.index.create_record(&blob_id)? {
                        reindexed += 1;
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("Skipping unreadable record {} in '{}': {}", blob_id, self.name, err),
            }
        }
        Ok(reindexed)
    }

    /// Removes temporary files left behind by interrupted writes.
    pub fn cleanup_orphan_tmp_files(&self) -> StoreResult<usize> {
        let max_age = Duration::from_secs(self.config.orphan_tmp_age_secs);
        let entries = match fs::read_dir(self.tmp_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Failed to read tmp entry in '{}': {}", self.name, err);
                    continue;
                }
            };
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age >= max_age && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Removed {} orphan tmp files from '{}'", removed, self.name);
        }
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> StoreResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!("Failed to clean up {}: {}", path.display(), err);
        }
    }
}

impl BlobStore for FileBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn store_type(&self) -> BlobStoreType {
        BlobStoreType::File
    }

    fn start(&self) -> StoreResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        fs::create_dir_all(self.config.root.join(CONTENT_DIR))?;
        fs::create_dir_all(self.tmp_dir())?;
        match self.load_persisted_metrics() {
            Some(metrics) => self.sizes.replace(metrics.blob_count, metrics.total_size),
            None => {
                self.recalculate_metrics()?;
            }
        }
        let reindexed = self.reindex_soft_deleted()?;
        self.started.store(true, Ordering::Release);
        info!(
            "Started file store '{}' at {} ({} soft-deleted blobs pending)",
            self.name,
            self.config.root.display(),
            reindexed
        );
        Ok(())
    }

    fn stop(&self) -> StoreResult<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist_metrics()?;
        info!("Stopped file store '{}'", self.name);
        Ok(())
    }

    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.ensure_started()?;
        validate_headers(&headers)?;
        let size = payload.len() as u64;
        self.check_quota(size)?;

        let record = self.new_record(size, sha256_hex(&payload), headers);
        self.place(&record, &payload)?;
        self.sizes.record_added(size);
        debug!("Created blob {} ({} bytes) in '{}'", record.blob_id, size, self.name);
        Ok(record)
    }

    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.ensure_started()?;
        validate_headers(&headers)?;
        let source = self.get(blob_id)?;
        if source.record.deleted {
            return Err(StoreError::BlobNotFound {
                blob_id: blob_id.clone(),
            });
        }
        self.check_quota(source.record.size)?;
        let record = self.new_record(source.record.size, source.record.sha256.clone(), headers);
        self.place(&record, &source.content)?;
        self.sizes.record_added(record.size);
        Ok(record)
    }

    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob> {
        let not_found = || StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        };
        let record = self.read_record(blob_id)?.ok_or_else(not_found)?;
        let content = match fs::read(self.bytes_file(blob_id)) {
            Ok(content) => Bytes::from(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Record for {} in '{}' has no payload file", blob_id, self.name);
                return Err(not_found());
            }
            Err(e) => return Err(e.into()),
        };
        let blob = Blob { record, content };
        blob.verify()?;
        Ok(blob)
    }

    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool> {
        Ok(self.properties_file(blob_id).is_file())
    }

    fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> StoreResult<bool> {
        let _guard = self.record_lock.lock();
        let record = self.read_record(blob_id)?.ok_or_else(|| StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        })?;
        if record.deleted {
            return Ok(false);
        }
        self.write_record(&record.mark_deleted(reason, Utc::now()))?;
        if let Err(err) = self.index.create_record(blob_id) {
            warn!("Failed to index soft delete of {}, restoring record: {}", blob_id, err);
            self.write_record(&record)?;
            return Err(err);
        }
        debug!("Soft-deleted blob {} in '{}': {}", blob_id, self.name, reason);
        Ok(true)
    }

    fn undelete(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let _guard = self.record_lock.lock();
        let record = self.read_record(blob_id)?.ok_or_else(|| StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        })?;
        if !record.deleted {
            return Ok(false);
        }
        self.write_record(&record.mark_undeleted())?;
        self.index.delete_record(blob_id)?;
        Ok(true)
    }

    fn delete_hard(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let _guard = self.record_lock.lock();
        let record = self.read_record(blob_id)?;
        let existed = self.remove_files(blob_id)?;
        self.index.delete_record(blob_id)?;
        if let Some(record) = record {
            self.sizes.record_removed(record.size);
        }
        Ok(existed)
    }

    fn reclaim(&self, blob_id: &BlobId, retention: Duration) -> StoreResult<ReclaimOutcome> {
        let _guard = self.record_lock.lock();
        let record = match self.read_record(blob_id)? {
            Some(record) if record.deleted => record,
            _ => {
                self.index.delete_record(blob_id)?;
                return Ok(ReclaimOutcome::Skipped);
            }
        };
        let deleted_at = record.deleted_at.unwrap_or(record.created_at);
        let retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        if deleted_at
            .checked_add_signed(retention)
            .map_or(true, |due| due > Utc::now())
        {
            return Ok(ReclaimOutcome::Retained);
        }
        self.remove_files(blob_id)?;
        self.index.delete_record(blob_id)?;
        self.sizes.record_removed(record.size);
        Ok(ReclaimOutcome::Reclaimed { bytes: record.size })
    }

    fn compact(&self, cancel: &CancelToken) -> StoreResult<CompactionStats> {
        let mut stats = CompactionStats::default();
        while let Some(blob_id) = self.index.get_next_available_record()? {
            cancel.check("compact")?;
            match self.reclaim(&blob_id, self.retention) {
                Ok(outcome) => stats.record(outcome),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!("Failed to reclaim {} in '{}': {}", blob_id, self.name, err),
            }
        }
        self.cleanup_orphan_tmp_files()?;
        info!(
            "Compacted file store '{}': {} examined, {} reclaimed, {} bytes",
            self.name, stats.examined, stats.reclaimed, stats.bytes_reclaimed
        );
        Ok(stats)
    }

    fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        let mut ids: Vec<BlobId> = DateBasedWalker::all(&self.config.root)
            .collect()
            .into_keys()
            .filter(|id| self.properties_file(id).is_file())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn metrics(&self) -> BlobStoreMetrics {
        let total_size = self.sizes.total_size();
        BlobStoreMetrics {
            blob_count: self.sizes.blob_count(),
            total_size,
            available_space: self
                .config
                .capacity
                .map_or(0, |capacity| capacity.saturating_sub(total_size)),
            unlimited: self.config.capacity.is_none(),
        }
    }

    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics> {
        let mut count = 0u64;
        let mut total = 0u64;
        for blob_id in self.blob_ids()? {
            match self.read_record(&blob_id) {
                Ok(Some(record)) => {
                    count += 1;
                    total += record.size;
                }
                Ok(None) => {}
                Err(err) => warn!("Skipping unreadable record {}: {}", blob_id, err),
            }
        }
        self.sizes.replace(count, total);
        debug!("Recalculated '{}': {} blobs, {} bytes", self.name, count, total);
        Ok(self.metrics())
    }

    fn soft_delete_index(&self) -> Option<&SoftDeletedBlobIndex> {
        Some(&self.index)
    }

    fn soft_delete_retention(&self) -> Duration {
        self.retention
    }

    fn is_writable(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn remove(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.config.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(
            "Removed file store '{}' at {}",
            self.name,
            self.config.root.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BLOB_NAME_HEADER, CREATED_BY_HEADER};
    use crate::soft_delete::InMemorySoftDeletedBlobDao;
    use crate::store::{QuotaKind, SOFT_DELETE_RETENTION_ATTR};
    use tempfile::TempDir;

    fn headers(name: &str) -> BlobHeaders {
        let mut h = BlobHeaders::new();
        h.insert(BLOB_NAME_HEADER.to_string(), name.to_string());
        h.insert(CREATED_BY_HEADER.to_string(), "tester".to_string());
        h
    }

    fn configuration() -> BlobStoreConfiguration {
        BlobStoreConfiguration::new("files", BlobStoreType::File).with_attribute(PATH_ATTR, "files")
    }

    fn open(dir: &TempDir, configuration: &BlobStoreConfiguration) -> FileBlobStore {
        let config = FileBlobStoreConfig::from_configuration(configuration, dir.path()).unwrap();
        let store = FileBlobStore::new(
            configuration,
            config,
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        store.start().unwrap();
        store
    }

    #[test]
    fn test_relative_path_resolves_against_base() {
        let config =
            FileBlobStoreConfig::from_configuration(&configuration(), Path::new("/srv/blobs"))
                .unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/blobs/files"));
        assert!(config.capacity.is_none());

        let missing = BlobStoreConfiguration::new("x", BlobStoreType::File);
        assert!(FileBlobStoreConfig::from_configuration(&missing, Path::new("/")).is_err());
    }

    #[test]
    fn test_create_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let record = store
            .create(Bytes::from_static(b"artifact bytes"), headers("a.jar"))
            .unwrap();
        let blob = store.get(&record.blob_id).unwrap();
        assert_eq!(blob.content, Bytes::from_static(b"artifact bytes"));
        assert_eq!(blob.record.header(BLOB_NAME_HEADER), Some("a.jar"));
        assert!(store.root().join(bytes_path(&record.blob_id)).is_file());
        assert!(store.root().join(properties_path(&record.blob_id)).is_file());
    }

    #[test]
    fn test_missing_required_header_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let mut h = headers("a");
        h.remove(CREATED_BY_HEADER);
        assert!(store.create(Bytes::from_static(b"x"), h).is_err());
        assert!(store.blob_ids().unwrap().is_empty());
    }

    #[test]
    fn test_soft_deleted_blob_is_still_readable() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        assert!(store.soft_delete(&record.blob_id, "cleanup").unwrap());
        assert!(!store.soft_delete(&record.blob_id, "cleanup").unwrap());
        let blob = store.get(&record.blob_id).unwrap();
        assert!(blob.record.deleted);
        assert_eq!(blob.record.deleted_reason.as_deref(), Some("cleanup"));
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 1);

        assert!(store.undelete(&record.blob_id).unwrap());
        assert!(!store.undelete(&record.blob_id).unwrap());
        assert!(!store.get(&record.blob_id).unwrap().record.deleted);
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 0);
    }

    #[test]
    fn test_torn_write_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let orphan = BlobId::generate();
        let path = store.root().join(bytes_path(&orphan));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"half").unwrap();

        assert!(store.get(&orphan).unwrap_err().is_not_found());
        assert!(!store.exists(&orphan).unwrap());
        assert!(store.blob_ids().unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_payload_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let record = store.create(Bytes::from_static(b"good"), headers("a")).unwrap();
        fs::write(store.root().join(bytes_path(&record.blob_id)), b"evil").unwrap();
        let err = store.get(&record.blob_id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_space_used_quota_rejects_before_writing() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration().with_quota(BlobStoreQuota {
            kind: QuotaKind::SpaceUsed,
            limit: 10,
        });
        let store = open(&dir, &configuration);
        store.create(Bytes::from_static(b"12345678"), headers("a")).unwrap();
        let err = store
            .create(Bytes::from_static(b"123"), headers("b"))
            .unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        assert_eq!(store.blob_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_space_remaining_uses_capacity() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration()
            .with_attribute(CAPACITY_ATTR, "100")
            .with_quota(BlobStoreQuota {
                kind: QuotaKind::SpaceRemaining,
                limit: 90,
            });
        let store = open(&dir, &configuration);
        store.create(Bytes::from(vec![0u8; 10]), headers("a")).unwrap();
        assert_eq!(store.metrics().available_space, 90);
        assert!(store.create(Bytes::from_static(b"x"), headers("b")).is_err());
    }

    #[test]
    fn test_metrics_persist_across_restart() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration();
        {
            let store = open(&dir, &configuration);
            store.create(Bytes::from_static(b"abc"), headers("a")).unwrap();
            store.create(Bytes::from_static(b"de"), headers("b")).unwrap();
            store.stop().unwrap();
        }
        assert!(dir.path().join("files").join(METRICS_FILE).is_file());
        let reopened = open(&dir, &configuration);
        assert_eq!(reopened.metrics().blob_count, 2);
        assert_eq!(reopened.metrics().total_size, 5);
    }

    #[test]
    fn test_soft_deletes_survive_restart() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration();
        let (kept, gone) = {
            let store = open(&dir, &configuration);
            let kept = store.create(Bytes::from_static(b"keep"), headers("k")).unwrap();
            let gone = store.create(Bytes::from_static(b"gone"), headers("g")).unwrap();
            store.soft_delete(&gone.blob_id, "cleanup").unwrap();
            store.stop().unwrap();
            (kept, gone)
        };

        // Fresh index, as after a process restart.
        let reopened = open(&dir, &configuration);
        let index = reopened.soft_delete_index().unwrap();
        assert_eq!(index.size().unwrap(), 1);
        let stats = reopened.compact(&CancelToken::none()).unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert!(!reopened.exists(&gone.blob_id).unwrap());
        assert!(reopened.get(&kept.blob_id).is_ok());
        assert_eq!(index.size().unwrap(), 0);
    }

    #[test]
    fn test_recalculate_without_persisted_metrics() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration();
        {
            let store = open(&dir, &configuration);
            store.create(Bytes::from_static(b"abc"), headers("a")).unwrap();
        }
        let reopened = open(&dir, &configuration);
        assert_eq!(reopened.metrics().blob_count, 1);
        assert_eq!(reopened.metrics().total_size, 3);
    }

    #[test]
    fn test_compact_honors_retention_and_cleans_tmp() {
        let dir = TempDir::new().unwrap();
        let configuration = configuration().with_attribute(SOFT_DELETE_RETENTION_ATTR, "3600");
        let mut config = FileBlobStoreConfig::from_configuration(&configuration, dir.path()).unwrap();
        config.orphan_tmp_age_secs = 0;
        let store = FileBlobStore::new(
            &configuration,
            config,
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        store.start().unwrap();
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        store.soft_delete(&record.blob_id, "cleanup").unwrap();
        fs::write(store.root().join(TEMP_DIR).join("stale.bytes.tmp"), b"x").unwrap();

        let stats = store.compact(&CancelToken::none()).unwrap();
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.reclaimed, 0);
        assert!(store.exists(&record.blob_id).unwrap());
        assert!(!store.root().join(TEMP_DIR).join("stale.bytes.tmp").exists());

        assert_eq!(
            store.reclaim(&record.blob_id, Duration::ZERO).unwrap(),
            ReclaimOutcome::Reclaimed { bytes: 1 }
        );
        assert!(!store.exists(&record.blob_id).unwrap());
        assert_eq!(store.metrics().blob_count, 0);
    }

    #[test]
    fn test_reclaim_skips_undeleted_blob() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        store.soft_delete(&record.blob_id, "oops").unwrap();
        store.undelete(&record.blob_id).unwrap();
        assert_eq!(
            store.reclaim(&record.blob_id, Duration::ZERO).unwrap(),
            ReclaimOutcome::Skipped
        );
        assert!(store.get(&record.blob_id).is_ok());
    }

    #[test]
    fn test_copy_and_delete_hard() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        let copy = store.copy(&record.blob_id, headers("b")).unwrap();
        assert_ne!(copy.blob_id, record.blob_id);
        assert_eq!(copy.sha256, record.sha256);
        assert_eq!(store.metrics().blob_count, 2);

        store.soft_delete(&record.blob_id, "x").unwrap();
        assert!(store.delete_hard(&record.blob_id).unwrap());
        assert!(!store.delete_hard(&record.blob_id).unwrap());
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 0);
        assert_eq!(store.blob_ids().unwrap(), vec![copy.blob_id]);
    }

    #[test]
    fn test_remove_deletes_directory() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, &configuration());
        store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        store.remove().unwrap();
        assert!(!dir.path().join("files").exists());
    }
}
