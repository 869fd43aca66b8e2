#![warn(missing_docs)]

//! binvault blob storage engine.
//!
//! Blob stores keep opaque payloads plus a small property record per blob,
//! addressed by time-prefixed [`BlobId`]s. Two backends are provided: a local
//! directory partitioned by creation hour ([`FileBlobStore`]) and an
//! S3-style object store ([`ObjectBlobStore`]). Stores can be combined into
//! groups, are owned by the [`BlobStoreManager`], and are maintained by tasks
//! run on a bounded worker pool ([`ParallelTaskRunner`]).
//!
//! Deletes are logical first: a soft-deleted blob is recorded in the store's
//! [`SoftDeletedBlobIndex`] and physically reclaimed by compaction once its
//! retention has elapsed.

pub mod blob;
pub mod cancel;
pub mod config_store;
pub mod encryption;
pub mod error;
pub mod file_store;
pub mod freeze;
pub mod group;
pub mod interceptor;
pub mod layout;
pub mod manager;
pub mod metrics;
pub mod object_client;
pub mod object_store;
pub mod soft_delete;
pub mod store;
pub mod task;
pub mod tasks;
pub mod walker;

pub use blob::{Blob, BlobHeaders, BlobId, BlobRecord};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use config_store::{
    BlobStoreConfigurationStore, InMemoryBlobStoreConfigurationStore, JsonFileConfigurationStore,
};
pub use encryption::EncryptionStrategy;
pub use error::{StoreError, StoreResult};
pub use file_store::{FileBlobStore, FileBlobStoreConfig};
pub use freeze::{FreezeService, LocalFreezeService};
pub use group::{FillPolicy, GroupBlobStore};
pub use interceptor::{FreezeGuardedBlobStore, MeteredBlobStore};
pub use manager::{BlobStoreManager, ManagerConfig, DEFAULT_STORE_NAME};
pub use metrics::{
    BlobStoreMetrics, OperationMetricsRegistry, OperationMetricsSnapshot, OperationType,
};
pub use object_client::{InMemoryObjectStorageClient, ObjectStorageClient};
pub use object_store::{ObjectBlobStore, ObjectBlobStoreConfig};
pub use soft_delete::{
    InMemorySoftDeletedBlobDao, SoftDeleteIndexConfig, SoftDeletedBlobDao, SoftDeletedBlobIndex,
};
pub use store::{
    BlobStore, BlobStoreConfiguration, BlobStoreQuota, BlobStoreType, CompactionStats,
    QuotaKind, ReclaimOutcome, StoreState,
};
pub use task::{
    MaintenanceTask, ParallelTaskConfig, ParallelTaskRunner, StoreLookup, TaskReport,
    ALL_STORES,
};
pub use tasks::{CompactBlobStoreTask, PurgeSoftDeletedBlobsTask, RecalculateMetricsTask};
pub use walker::DateBasedWalker;
