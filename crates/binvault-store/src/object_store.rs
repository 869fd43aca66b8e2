//! Blob store backed by S3-compatible object storage.
//!
//! Each blob is two objects under the store prefix: the payload at
//! `content/<hour>/<id>.bytes` and its record at `.properties`. The payload
//! is uploaded first and the record last, so a blob is visible only once
//! both exist. Soft-deleted blobs are hidden from `get`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::blob::{sha256_hex, validate_headers, Blob, BlobHeaders, BlobId, BlobRecord};
use crate::cancel::CancelToken;
use crate::encryption::EncryptionStrategy;
use crate::error::{StoreError, StoreResult};
use crate::layout::{bytes_path, properties_path, CONTENT_DIR, PROPERTIES_EXTENSION};
use crate::metrics::{BlobStoreMetrics, BlobStoreMetricsTracker};
use crate::object_client::{
    CopyObjectRequest, InitiateMultipartRequest, ObjectHeaders, ObjectStorageClient,
    PutObjectRequest,
};
use crate::soft_delete::{SoftDeleteIndexConfig, SoftDeletedBlobDao, SoftDeletedBlobIndex};
use crate::store::{
    BlobStore, BlobStoreConfiguration, BlobStoreQuota, BlobStoreType, CompactionStats,
    ReclaimOutcome,
};
use crate::walker::parse_blob_path;

/// Attribute naming the bucket.
pub const BUCKET_ATTR: &str = "bucket";
/// Attribute holding the key prefix inside the bucket.
pub const PREFIX_ATTR: &str = "prefix";
/// Attribute holding the multipart threshold in bytes.
pub const MULTIPART_THRESHOLD_ATTR: &str = "multipart_threshold";
/// Attribute holding the multipart part size in bytes.
pub const PART_SIZE_ATTR: &str = "multipart_part_size";

const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_PART_SIZE: u64 = 100 * 1024 * 1024;
const LIST_PAGE_SIZE: usize = 1000;

/// Settings of an object-storage store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBlobStoreConfig {
    /// Bucket holding the store's objects.
    pub bucket: String,
    /// Key prefix, empty or ending in `/`.
    pub prefix: String,
    /// Payloads larger than this are uploaded in parts (default: 5 GiB).
    pub multipart_threshold: u64,
    /// Part size for multipart uploads (default: 100 MiB).
    pub part_size: u64,
    /// Server-side encryption applied to writes.
    pub encryption: EncryptionStrategy,
    /// Create the bucket on start if it is missing.
    pub create_bucket: bool,
}

impl Default for ObjectBlobStoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            encryption: EncryptionStrategy::None,
            create_bucket: true,
        }
    }
}

impl ObjectBlobStoreConfig {
    /// Reads the settings from a store configuration.
    pub fn from_configuration(config: &BlobStoreConfiguration) -> StoreResult<Self> {
        let prefix = config
            .attribute(PREFIX_ATTR)
            .map(|p| p.trim().trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p))
            .unwrap_or_default();
        let part_size = config.u64_attribute(PART_SIZE_ATTR, DEFAULT_PART_SIZE)?;
        if part_size == 0 {
            return Err(StoreError::Configuration(format!(
                "store '{}' has a zero multipart part size",
                config.name
            )));
        }
        Ok(Self {
            bucket: config.required_attribute(BUCKET_ATTR)?.trim().to_string(),
            prefix,
            multipart_threshold: config
                .u64_attribute(MULTIPART_THRESHOLD_ATTR, DEFAULT_MULTIPART_THRESHOLD)?,
            part_size,
            encryption: EncryptionStrategy::from_config(config)?,
            create_bucket: true,
        })
    }
}

/// Builds object keys under a store prefix.
#[derive(Debug, Clone)]
pub struct ObjectKeyBuilder {
    prefix: String,
}

impl ObjectKeyBuilder {
    /// Creates a builder for `prefix` (empty or ending in `/`).
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Key of a blob's payload.
    pub fn bytes_key(&self, blob_id: &BlobId) -> String {
        format!("{}{}", self.prefix, bytes_path(blob_id))
    }

    /// Key of a blob's record.
    pub fn properties_key(&self, blob_id: &BlobId) -> String {
        format!("{}{}", self.prefix, properties_path(blob_id))
    }

    /// Prefix under which all blob content lives.
    pub fn content_prefix(&self) -> String {
        format!("{}{}/", self.prefix, CONTENT_DIR)
    }

    /// Prefix of every object the store owns.
    pub fn store_prefix(&self) -> &str {
        &self.prefix
    }
}

/// Blob store over an [`ObjectStorageClient`].
pub struct ObjectBlobStore {
    name: String,
    config: ObjectBlobStoreConfig,
    keys: ObjectKeyBuilder,
    client: Arc<dyn ObjectStorageClient>,
    index: SoftDeletedBlobIndex,
    sizes: BlobStoreMetricsTracker,
    quota: Option<BlobStoreQuota>,
    retention: Duration,
    started: AtomicBool,
    record_lock: Mutex<()>,
}

impl ObjectBlobStore {
    /// Creates the store and binds its soft-delete index.
    pub fn new(
        configuration: &BlobStoreConfiguration,
        client: Arc<dyn ObjectStorageClient>,
        dao: Arc<dyn SoftDeletedBlobDao>,
        index_config: SoftDeleteIndexConfig,
    ) -> StoreResult<Self> {
        let config = ObjectBlobStoreConfig::from_configuration(configuration)?;
        let index = SoftDeletedBlobIndex::new(dao, index_config);
        index.init(&configuration.name)?;
        Ok(Self {
            name: configuration.name.clone(),
            keys: ObjectKeyBuilder::new(&config.prefix),
            config,
            client,
            index,
            sizes: BlobStoreMetricsTracker::default(),
            quota: configuration.quota,
            retention: configuration.soft_delete_retention()?,
            started: AtomicBool::new(false),
            record_lock: Mutex::new(()),
        })
    }

    /// The store's settings.
    pub fn config(&self) -> &ObjectBlobStoreConfig {
        &self.config
    }

    fn bucket(&self) -> &str {
        &self.config.bucket
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

    fn read_record(&self, blob_id: &BlobId) -> StoreResult<Option<BlobRecord>> {
        let key = self.keys.properties_key(blob_id);
        let Some(object) = self.client.get_object(self.bucket(), &key)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&object.body);
        let record =
            BlobRecord::from_properties(blob_id.clone(), &self.keys.bytes_key(blob_id), &text)?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &BlobRecord) -> StoreResult<()> {
        let mut headers = ObjectHeaders::new();
        self.config.encryption.decorate_put(&mut headers);
        self.client.put_object(PutObjectRequest {
            bucket: self.bucket().to_string(),
            key: self.keys.properties_key(&record.blob_id),
            body: Bytes::from(record.to_properties()),
            headers,
        })
    }

    fn upload_payload(&self, key: &str, payload: Bytes) -> StoreResult<()> {
        if payload.len() as u64 <= self.config.multipart_threshold {
            let mut headers = ObjectHeaders::new();
            self.config.encryption.decorate_put(&mut headers);
            return self.client.put_object(PutObjectRequest {
                bucket: self.bucket().to_string(),
                key: key.to_string(),
                body: payload,
                headers,
            });
        }

        let mut headers = ObjectHeaders::new();
        self.config.encryption.decorate_multipart_init(&mut headers);
        let upload_id = self.client.initiate_multipart(InitiateMultipartRequest {
            bucket: self.bucket().to_string(),
            key: key.to_string(),
            headers,
        })?;
        let part_size = self.config.part_size as usize;
        let result = (|| {
            let mut offset = 0usize;
            let mut part_number = 1u32;
            while offset < payload.len() {
                let end = (offset + part_size).min(payload.len());
                self.client.upload_part(
                    self.bucket(),
                    key,
                    &upload_id,
                    part_number,
                    payload.slice(offset..end),
                )?;
                offset = end;
                part_number += 1;
            }
            self.client.complete_multipart(self.bucket(), key, &upload_id)
        })();
        if let Err(err) = result {
            warn!(
                "Multipart upload of {} to store '{}' failed, aborting: {}",
                key, self.name, err
            );
            if let Err(abort_err) = self.client.abort_multipart(self.bucket(), key, &upload_id) {
                warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
            }
            return Err(err);
        }
        debug!("Uploaded {} in parts of {} bytes", key, part_size);
        Ok(())
    }

    fn delete_quietly(&self, key: &str) {
        if let Err(err) = self.client.delete_object(self.bucket(), key) {
            warn!("Failed to clean up object {} in store '{}': {}", key, self.name, err);
        }
    }

    fn check_quota(&self, incoming: u64) -> StoreResult<()> {
        match &self.quota {
            Some(quota) => quota.check(&self.name, &self.metrics(), incoming),
            None => Ok(()),
        }
    }

    fn new_record(&self, payload_len: u64, sha256: String, headers: BlobHeaders) -> BlobRecord {
        let now = Utc::now();
        let blob_id = BlobId::new(now);
        BlobRecord {
            location: self.keys.bytes_key(&blob_id),
            blob_id,
            size: payload_len,
            sha256,
            created_at: now,
            headers,
            deleted: false,
            deleted_reason: None,
            deleted_at: None,
        }
    }

    fn remove_objects(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let payload = self
            .client
            .delete_object(self.bucket(), &self.keys.bytes_key(blob_id))?;
        let record = self
            .client
            .delete_object(self.bucket(), &self.keys.properties_key(blob_id))?;
        Ok(payload || record)
    }

    /// Recounts sizes. With `reindex`, records still marked deleted are put
    /// back into the soft-delete index; returns how many were missing.
    fn scan_records(&self, reindex: bool) -> StoreResult<u64> {
        let (mut count, mut total, mut reindexed) = (0u64, 0u64, 0u64);
        for blob_id in self.blob_ids()? {
            let Some(record) = self.read_record(&blob_id)? else {
                continue;
            };
            count += 1;
            total += record.size;
            if reindex && record.deleted && self.index.create_record(&blob_id)? {
                reindexed += 1;
            }
        }
        self.sizes.replace(count, total);
        debug!("Recalculated '{}': {} blobs, {} bytes", self.name, count, total);
        Ok(reindexed)
    }

    fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self.client.list_objects(
                self.bucket(),
                prefix,
                continuation.as_deref(),
                LIST_PAGE_SIZE,
            )?;
            keys.extend(page.keys);
            match page.continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        Ok(keys)
    }
}

impl BlobStore for ObjectBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn store_type(&self) -> BlobStoreType {
        BlobStoreType::S3
    }

    fn start(&self) -> StoreResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.client.bucket_exists(self.bucket())? {
            if !self.config.create_bucket {
                return Err(StoreError::Configuration(format!(
                    "bucket '{}' for store '{}' does not exist",
                    self.bucket(),
                    self.name
                )));
            }
            self.client.create_bucket(self.bucket())?;
        }
        let reindexed = self.scan_records(true)?;
        self.started.store(true, Ordering::Release);
        info!(
            "Started object store '{}' on bucket '{}' ({} soft-deleted blobs pending)",
            self.name,
            self.bucket(),
            reindexed
        );
        Ok(())
    }

    fn stop(&self) -> StoreResult<()> {
        if self.started.swap(false, Ordering::AcqRel) {
            info!("Stopped object store '{}'", self.name);
        }
        Ok(())
    }

    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.ensure_started()?;
        validate_headers(&headers)?;
        let size = payload.len() as u64;
        self.check_quota(size)?;

        let record = self.new_record(size, sha256_hex(&payload), headers);
        let bytes_key = self.keys.bytes_key(&record.blob_id);
        if let Err(err) = self.upload_payload(&bytes_key, payload) {
            self.delete_quietly(&bytes_key);
            return Err(err);
        }
        if let Err(err) = self.write_record(&record) {
            self.delete_quietly(&bytes_key);
            return Err(err);
        }
        self.sizes.record_added(size);
        debug!("Created blob {} ({} bytes) in '{}'", record.blob_id, size, self.name);
        Ok(record)
    }

    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.ensure_started()?;
        validate_headers(&headers)?;
        let source = match self.read_record(blob_id)? {
            Some(record) if !record.deleted => record,
            _ => {
                return Err(StoreError::BlobNotFound {
                    blob_id: blob_id.clone(),
                })
            }
        };
        self.check_quota(source.size)?;

        let record = self.new_record(source.size, source.sha256.clone(), headers);
        let bytes_key = self.keys.bytes_key(&record.blob_id);
        let mut request_headers = ObjectHeaders::new();
        self.config.encryption.decorate_copy(&mut request_headers);
        if let Err(err) = self.client.copy_object(CopyObjectRequest {
            bucket: self.bucket().to_string(),
            source_key: self.keys.bytes_key(blob_id),
            destination_key: bytes_key.clone(),
            headers: request_headers,
        }) {
            self.delete_quietly(&bytes_key);
            return Err(err);
        }
        if let Err(err) = self.write_record(&record) {
            self.delete_quietly(&bytes_key);
            return Err(err);
        }
        self.sizes.record_added(record.size);
        Ok(record)
    }

    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob> {
        let not_found = || StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        };
        let record = match self.read_record(blob_id)? {
            Some(record) if !record.deleted => record,
            _ => return Err(not_found()),
        };
        let Some(object) = self.client.get_object(self.bucket(), &record.location)? else {
            warn!(
                "Record for {} in '{}' has no payload object",
                blob_id, self.name
            );
            return Err(not_found());
        };
        let blob = Blob {
            record,
            content: object.body,
        };
        blob.verify()?;
        Ok(blob)
    }

    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.client
            .head_object(self.bucket(), &self.keys.properties_key(blob_id))
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
        let existed = self.remove_objects(blob_id)?;
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
        self.remove_objects(blob_id)?;
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
        info!(
            "Compacted object store '{}': {} examined, {} reclaimed, {} bytes",
            self.name, stats.examined, stats.reclaimed, stats.bytes_reclaimed
        );
        Ok(stats)
    }

    fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        let suffix = format!(".{}", PROPERTIES_EXTENSION);
        let mut ids: Vec<BlobId> = self
            .list_keys(&self.keys.content_prefix())?
            .into_iter()
            .filter(|key| key.ends_with(&suffix))
            .filter_map(|key| parse_blob_path(&key).map(|(id, _)| id))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn metrics(&self) -> BlobStoreMetrics {
        BlobStoreMetrics {
            blob_count: self.sizes.blob_count(),
            total_size: self.sizes.total_size(),
            available_space: 0,
            unlimited: true,
        }
    }

    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics> {
        self.scan_records(false)?;
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
        let keys = self.list_keys(self.keys.store_prefix())?;
        for key in &keys {
            self.client.delete_object(self.bucket(), key)?;
        }
        info!(
            "Removed {} objects of store '{}' from bucket '{}'",
            keys.len(),
            self.name,
            self.bucket()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BLOB_NAME_HEADER, CREATED_BY_HEADER};
    use crate::encryption::{
        ENCRYPTION_KEY_ATTR, ENCRYPTION_TYPE_ATTR, HEADER_SSE, HEADER_SSE_KMS_KEY_ID,
    };
    use crate::object_client::InMemoryObjectStorageClient;
    use crate::soft_delete::InMemorySoftDeletedBlobDao;

    fn headers(name: &str) -> BlobHeaders {
        let mut h = BlobHeaders::new();
        h.insert(BLOB_NAME_HEADER.to_string(), name.to_string());
        h.insert(CREATED_BY_HEADER.to_string(), "tester".to_string());
        h
    }

    fn store_with(
        config: BlobStoreConfiguration,
    ) -> (ObjectBlobStore, Arc<InMemoryObjectStorageClient>) {
        let client = Arc::new(InMemoryObjectStorageClient::new());
        let store = ObjectBlobStore::new(
            &config,
            client.clone(),
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        store.start().unwrap();
        (store, client)
    }

    fn base_config() -> BlobStoreConfiguration {
        BlobStoreConfiguration::new("s3", BlobStoreType::S3)
            .with_attribute(BUCKET_ATTR, "artifacts")
            .with_attribute(PREFIX_ATTR, "/team/")
    }

    #[test]
    fn test_config_requires_bucket() {
        let config = BlobStoreConfiguration::new("s3", BlobStoreType::S3);
        assert!(matches!(
            ObjectBlobStoreConfig::from_configuration(&config),
            Err(StoreError::Configuration(_))
        ));
        let parsed = ObjectBlobStoreConfig::from_configuration(&base_config()).unwrap();
        assert_eq!(parsed.prefix, "team/");
        assert_eq!(parsed.multipart_threshold, DEFAULT_MULTIPART_THRESHOLD);
    }

    #[test]
    fn test_create_get_round_trip() {
        let (store, client) = store_with(base_config());
        let record = store
            .create(Bytes::from_static(b"payload"), headers("a.jar"))
            .unwrap();
        assert!(record.location.starts_with("team/content/"));
        let blob = store.get(&record.blob_id).unwrap();
        assert_eq!(blob.content, Bytes::from_static(b"payload"));
        assert_eq!(client.object_count("artifacts"), 2);
        assert_eq!(store.metrics().blob_count, 1);
    }

    #[test]
    fn test_create_before_start_is_invalid_state() {
        let client = Arc::new(InMemoryObjectStorageClient::new());
        let store = ObjectBlobStore::new(
            &base_config(),
            client,
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            store.create(Bytes::new(), headers("x")),
            Err(StoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failed_record_write_leaves_nothing() {
        let (store, client) = store_with(base_config());
        let kept = store.create(Bytes::from_static(b"x"), headers("ok")).unwrap();

        client.fail_writes_to(".properties");
        let err = store
            .create(Bytes::from_static(b"y"), headers("fail"))
            .unwrap_err();
        assert!(err.is_retryable());
        client.clear_failures();

        assert_eq!(client.object_count("artifacts"), 2);
        assert_eq!(store.blob_ids().unwrap(), vec![kept.blob_id.clone()]);
        assert_eq!(store.metrics().blob_count, 1);
    }

    #[test]
    fn test_soft_deleted_blob_is_hidden() {
        let (store, _) = store_with(base_config());
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        assert!(store.soft_delete(&record.blob_id, "cleanup").unwrap());
        assert!(!store.soft_delete(&record.blob_id, "cleanup").unwrap());
        assert!(store.get(&record.blob_id).unwrap_err().is_not_found());
        assert!(store.exists(&record.blob_id).unwrap());
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 1);

        assert!(store.undelete(&record.blob_id).unwrap());
        assert!(store.get(&record.blob_id).is_ok());
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 0);
    }

    #[test]
    fn test_encryption_headers_on_every_write() {
        let config = base_config()
            .with_attribute(ENCRYPTION_TYPE_ATTR, "kmsManagedEncryption")
            .with_attribute(ENCRYPTION_KEY_ATTR, "key-1");
        let (store, client) = store_with(config);
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        let copy = store.copy(&record.blob_id, headers("b")).unwrap();
        for key in [
            record.location.clone(),
            copy.location.clone(),
            ObjectKeyBuilder::new("team/").properties_key(&copy.blob_id),
        ] {
            let stored = client.object_headers("artifacts", &key).unwrap();
            assert_eq!(stored[HEADER_SSE], "aws:kms");
            assert_eq!(stored[HEADER_SSE_KMS_KEY_ID], "key-1");
        }
        assert_eq!(client.stats().copies, 1);
    }

    #[test]
    fn test_multipart_above_threshold() {
        let config = base_config()
            .with_attribute(MULTIPART_THRESHOLD_ATTR, "4")
            .with_attribute(PART_SIZE_ATTR, "3")
            .with_attribute(ENCRYPTION_TYPE_ATTR, "s3ManagedEncryption");
        let (store, client) = store_with(config);
        let record = store
            .create(Bytes::from_static(b"0123456789"), headers("big"))
            .unwrap();
        assert_eq!(
            store.get(&record.blob_id).unwrap().content,
            Bytes::from_static(b"0123456789")
        );
        let stats = client.stats();
        assert_eq!(stats.multipart_initiated, 1);
        assert_eq!(stats.multipart_completed, 1);
        assert_eq!(
            client.object_headers("artifacts", &record.location).unwrap()[HEADER_SSE],
            "AES256"
        );
    }

    #[test]
    fn test_multipart_failure_aborts_upload() {
        let config = base_config()
            .with_attribute(MULTIPART_THRESHOLD_ATTR, "4")
            .with_attribute(PART_SIZE_ATTR, "3");
        let (store, client) = store_with(config);
        client.fail_writes_to(".bytes");
        assert!(store
            .create(Bytes::from_static(b"0123456789"), headers("big"))
            .is_err());
        client.clear_failures();

        let stats = client.stats();
        assert_eq!(stats.multipart_initiated, 1);
        assert_eq!(stats.multipart_aborted, 1);
        assert_eq!(client.pending_uploads(), 0);
        assert_eq!(client.object_count("artifacts"), 0);
    }

    #[test]
    fn test_reclaim_respects_retention() {
        let config = base_config().with_attribute(crate::store::SOFT_DELETE_RETENTION_ATTR, "3600");
        let (store, client) = store_with(config);
        let record = store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        store.soft_delete(&record.blob_id, "gone").unwrap();
        assert_eq!(
            store.reclaim(&record.blob_id, store.soft_delete_retention()).unwrap(),
            ReclaimOutcome::Retained
        );
        assert_eq!(
            store.reclaim(&record.blob_id, Duration::ZERO).unwrap(),
            ReclaimOutcome::Reclaimed { bytes: 1 }
        );
        assert_eq!(client.object_count("artifacts"), 0);
        assert_eq!(store.metrics().blob_count, 0);
        assert_eq!(store.soft_delete_index().unwrap().size().unwrap(), 0);
    }

    #[test]
    fn test_compact_reclaims_all_pending() {
        let (store, client) = store_with(base_config());
        let keep = store.create(Bytes::from_static(b"keep"), headers("k")).unwrap();
        for i in 0..3 {
            let r = store
                .create(Bytes::from(format!("blob-{}", i)), headers("d"))
                .unwrap();
            store.soft_delete(&r.blob_id, "cleanup").unwrap();
        }
        let stats = store.compact(&CancelToken::none()).unwrap();
        assert_eq!(stats.reclaimed, 3);
        assert_eq!(store.blob_ids().unwrap(), vec![keep.blob_id.clone()]);
        assert_eq!(client.object_count("artifacts"), 2);
    }

    #[test]
    fn test_soft_deletes_survive_restart() {
        let (store, client) = store_with(base_config());
        let keep = store.create(Bytes::from_static(b"keep"), headers("k")).unwrap();
        let gone = store.create(Bytes::from_static(b"gone"), headers("g")).unwrap();
        store.soft_delete(&gone.blob_id, "cleanup").unwrap();
        store.stop().unwrap();

        let reopened = ObjectBlobStore::new(
            &base_config(),
            client.clone(),
            Arc::new(InMemorySoftDeletedBlobDao::new()),
            SoftDeleteIndexConfig::default(),
        )
        .unwrap();
        reopened.start().unwrap();
        assert_eq!(reopened.soft_delete_index().unwrap().size().unwrap(), 1);
        assert_eq!(reopened.metrics().blob_count, 2);

        let stats = reopened.compact(&CancelToken::none()).unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(reopened.blob_ids().unwrap(), vec![keep.blob_id.clone()]);
        assert_eq!(client.object_count("artifacts"), 2);
    }

    #[test]
    fn test_remove_deletes_only_prefix() {
        let (store, client) = store_with(base_config());
        store.create(Bytes::from_static(b"x"), headers("a")).unwrap();
        client
            .put_object(PutObjectRequest {
                bucket: "artifacts".into(),
                key: "other/keep".into(),
                body: Bytes::new(),
                headers: ObjectHeaders::new(),
            })
            .unwrap();
        store.remove().unwrap();
        assert_eq!(client.object_count("artifacts"), 1);
    }
}
