//! The blob store contract shared by every backend, plus store configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::blob::{Blob, BlobHeaders, BlobId, BlobRecord};
use crate::cancel::CancelToken;
use crate::error::{StoreError, StoreResult};
use crate::metrics::{BlobStoreMetrics, OperationMetricsSnapshot, OperationType};
use crate::soft_delete::SoftDeletedBlobIndex;

/// Attribute key: retention in seconds before a soft-deleted blob may be reclaimed.
pub const SOFT_DELETE_RETENTION_ATTR: &str = "soft_delete_retention_secs";

/// Backend technology of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobStoreType {
    /// Local filesystem with the date-partitioned layout.
    File,
    /// S3-compatible object storage.
    S3,
    /// Virtual store fanning out to member stores.
    Group,
}

impl BlobStoreType {
    /// Parses the persisted type name.
    pub fn parse(value: &str) -> StoreResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "file" => Ok(BlobStoreType::File),
            "s3" => Ok(BlobStoreType::S3),
            "group" => Ok(BlobStoreType::Group),
            other => Err(StoreError::Configuration(format!(
                "unknown blob store type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BlobStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobStoreType::File => write!(f, "file"),
            BlobStoreType::S3 => write!(f, "s3"),
            BlobStoreType::Group => write!(f, "group"),
        }
    }
}

/// How a quota limit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuotaKind {
    /// Total stored bytes may not exceed the limit.
    SpaceUsed,
    /// Available bytes may not drop below the limit.
    SpaceRemaining,
}

/// Optional capacity limit for a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreQuota {
    /// Interpretation of `limit`.
    pub kind: QuotaKind,
    /// Limit in bytes.
    pub limit: u64,
}

impl BlobStoreQuota {
    /// Rejects a write of `incoming` bytes that would violate the quota.
    pub fn check(&self, store: &str, metrics: &BlobStoreMetrics, incoming: u64) -> StoreResult<()> {
        match self.kind {
            QuotaKind::SpaceUsed => {
                let after = metrics.total_size.saturating_add(incoming);
                if after > self.limit {
                    return Err(StoreError::QuotaExceeded {
                        store: store.to_string(),
                        reason: format!(
                            "space used would be {} bytes, limit is {}",
                            after, self.limit
                        ),
                    });
                }
            }
            QuotaKind::SpaceRemaining => {
                if metrics.unlimited {
                    return Ok(());
                }
                let remaining = metrics.available_space.saturating_sub(incoming);
                if remaining < self.limit {
                    return Err(StoreError::QuotaExceeded {
                        store: store.to_string(),
                        reason: format!(
                            "space remaining would be {} bytes, minimum is {}",
                            remaining, self.limit
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Persisted configuration of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobStoreConfiguration {
    /// Unique store name.
    pub name: String,
    /// Backend technology.
    #[serde(rename = "type")]
    pub store_type: BlobStoreType,
    /// Backend-specific attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Optional capacity limit.
    #[serde(default)]
    pub quota: Option<BlobStoreQuota>,
    /// Group this store belongs to, if any.
    #[serde(default)]
    pub parent_group: Option<String>,
}

impl BlobStoreConfiguration {
    /// Creates a configuration with no attributes.
    pub fn new(name: &str, store_type: BlobStoreType) -> Self {
        Self {
            name: name.to_string(),
            store_type,
            attributes: BTreeMap::new(),
            quota: None,
            parent_group: None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Builder-style quota setter.
    pub fn with_quota(mut self, quota: BlobStoreQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Returns an attribute value.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Returns an attribute value or a configuration error naming it.
    pub fn required_attribute(&self, key: &str) -> StoreResult<&str> {
        self.attribute(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                StoreError::Configuration(format!(
                    "store '{}' is missing required attribute '{}'",
                    self.name, key
                ))
            })
    }

    /// Parses a numeric attribute, falling back to `default` when absent.
    pub fn u64_attribute(&self, key: &str, default: u64) -> StoreResult<u64> {
        match self.attribute(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                StoreError::Configuration(format!(
                    "store '{}' attribute '{}' is not a number: '{}'",
                    self.name, key, raw
                ))
            }),
        }
    }

    /// Retention before soft-deleted blobs may be reclaimed (default: none).
    pub fn soft_delete_retention(&self) -> StoreResult<Duration> {
        Ok(Duration::from_secs(
            self.u64_attribute(SOFT_DELETE_RETENTION_ATTR, 0)?,
        ))
    }

    /// Checks the name is usable as a store and directory name.
    pub fn validate_name(&self) -> StoreResult<()> {
        let ok = !self.name.is_empty()
            && self.name.len() <= 255
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !self.name.starts_with('.');
        if !ok {
            return Err(StoreError::Configuration(format!(
                "invalid blob store name '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a managed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreState {
    /// Configuration known, nothing built yet.
    Unconfigured,
    /// Backend is being opened.
    Starting,
    /// Serving requests.
    Started,
    /// Backend is being closed.
    Stopping,
    /// Closed.
    Stopped,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Result of trying to reclaim one soft-deleted blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Payload and record were removed.
    Reclaimed {
        /// Bytes freed.
        bytes: u64,
    },
    /// Still inside its retention window.
    Retained,
    /// Not soft-deleted (undeleted meanwhile) or already gone.
    Skipped,
}

/// Statistics from one compaction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    /// Pending records examined.
    pub examined: u64,
    /// Blobs physically removed.
    pub reclaimed: u64,
    /// Blobs kept because their retention had not elapsed.
    pub retained: u64,
    /// Bytes freed.
    pub bytes_reclaimed: u64,
}

impl CompactionStats {
    /// Folds a single reclaim outcome into the totals.
    pub fn record(&mut self, outcome: ReclaimOutcome) {
        self.examined += 1;
        match outcome {
            ReclaimOutcome::Reclaimed { bytes } => {
                self.reclaimed += 1;
                self.bytes_reclaimed += bytes;
            }
            ReclaimOutcome::Retained => self.retained += 1,
            ReclaimOutcome::Skipped => {}
        }
    }

    /// Adds another run's totals.
    pub fn merge(&mut self, other: &CompactionStats) {
        self.examined += other.examined;
        self.reclaimed += other.reclaimed;
        self.retained += other.retained;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

/// Operations every blob store backend provides.
pub trait BlobStore: Send + Sync {
    /// The store's unique name.
    fn name(&self) -> &str;

    /// Backend technology.
    fn store_type(&self) -> BlobStoreType;

    /// Opens the backend. Idempotent.
    fn start(&self) -> StoreResult<()>;

    /// Closes the backend, flushing persisted metrics. Idempotent.
    fn stop(&self) -> StoreResult<()>;

    /// Writes a blob; payload and record both exist afterwards or neither does.
    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord>;

    /// Duplicates an existing blob under a new id with new headers.
    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord>;

    /// Reads a blob and verifies its hash.
    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob>;

    /// Whether a record exists for the blob, deleted or not.
    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool>;

    /// Marks a blob deleted. Returns false if it already was.
    fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> StoreResult<bool>;

    /// Restores a soft-deleted blob. Returns false if it was not deleted.
    fn undelete(&self, blob_id: &BlobId) -> StoreResult<bool>;

    /// Removes payload and record immediately.
    fn delete_hard(&self, blob_id: &BlobId) -> StoreResult<bool>;

    /// Reclaims one soft-deleted blob if it is older than `retention`.
    fn reclaim(&self, blob_id: &BlobId, retention: Duration) -> StoreResult<ReclaimOutcome>;

    /// Reclaims every soft-deleted blob whose retention has elapsed.
    fn compact(&self, cancel: &CancelToken) -> StoreResult<CompactionStats>;

    /// Every blob id with a record in the store.
    fn blob_ids(&self) -> StoreResult<Vec<BlobId>>;

    /// Current size metrics.
    fn metrics(&self) -> BlobStoreMetrics;

    /// Recounts size metrics from the backend.
    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics>;

    /// Operation counters, empty for stores that are not metered.
    fn operation_metrics(&self) -> Vec<(OperationType, OperationMetricsSnapshot)> {
        Vec::new()
    }

    /// Pending-deletion index, `None` for virtual stores.
    fn soft_delete_index(&self) -> Option<&SoftDeletedBlobIndex>;

    /// Retention configured for soft-deleted blobs.
    fn soft_delete_retention(&self) -> Duration {
        Duration::ZERO
    }

    /// Member store names for group stores.
    fn members(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether writes are currently accepted.
    fn is_writable(&self) -> bool;

    /// Destroys the backend's data. Only called on store deletion.
    fn remove(&self) -> StoreResult<()>;
}
