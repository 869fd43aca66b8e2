//! Store administration on top of the blob store manager.

use anyhow::{bail, Context, Result};
use binvault_store::file_store::FileBlobStoreConfig;
use binvault_store::{
    BlobId, BlobStoreConfiguration, BlobStoreManager, BlobStoreType, CancelToken,
    CompactBlobStoreTask, DateBasedWalker, JsonFileConfigurationStore, MaintenanceTask,
    ParallelTaskRunner, PurgeSoftDeletedBlobsTask, RecalculateMetricsTask, TaskReport,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::MgmtConfig;

/// One row of `stores list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRow {
    /// Store name.
    pub name: String,
    /// Backend type.
    pub store_type: BlobStoreType,
    /// Lifecycle state.
    pub state: String,
    /// Owning group, if any.
    pub group: Option<String>,
    /// Blob count.
    pub blob_count: u64,
    /// Stored bytes.
    pub total_size: u64,
}

/// Opened store manager plus the settings it was built from.
pub struct Admin {
    config: MgmtConfig,
    manager: Arc<BlobStoreManager>,
}

impl Admin {
    /// Builds and starts the manager described by `config`.
    pub fn open(config: MgmtConfig) -> Result<Self> {
        let stores = Arc::new(JsonFileConfigurationStore::new(config.stores_path()));
        let manager = Arc::new(BlobStoreManager::new(config.manager_config(), stores));
        manager
            .start()
            .context("failed to start blob stores")?;
        Ok(Self { config, manager })
    }

    /// The underlying manager.
    pub fn manager(&self) -> &Arc<BlobStoreManager> {
        &self.manager
    }

    /// Every registered store with its current size.
    pub fn list_stores(&self) -> Vec<StoreRow> {
        self.manager
            .browse()
            .into_iter()
            .map(|store| {
                let metrics = store.metrics();
                StoreRow {
                    name: store.name().to_string(),
                    store_type: store.store_type(),
                    state: self
                        .manager
                        .state(store.name())
                        .map_or_else(|| "unknown".to_string(), |s| s.to_string()),
                    group: self.manager.get_parent(store.name()),
                    blob_count: metrics.blob_count,
                    total_size: metrics.total_size,
                }
            })
            .collect()
    }

    /// Creates a store from a type name and attributes.
    pub fn create_store(
        &self,
        name: &str,
        store_type: &str,
        attributes: &[(String, String)],
    ) -> Result<()> {
        let mut config = BlobStoreConfiguration::new(name, BlobStoreType::parse(store_type)?);
        for (key, value) in attributes {
            config = config.with_attribute(key, value);
        }
        self.manager.create(config)?;
        info!("Created blob store '{}'", name);
        Ok(())
    }

    /// Deletes a store and its data.
    pub fn delete_store(&self, name: &str) -> Result<()> {
        self.manager.delete(name)?;
        Ok(())
    }

    fn run_task<T: MaintenanceTask>(
        &self,
        task: &T,
        selection: &str,
        cancel: &CancelToken,
    ) -> Result<TaskReport<T::Output>> {
        let runner = ParallelTaskRunner::new(self.config.tasks.clone());
        Ok(runner.run(task, self.manager.as_ref(), selection, cancel)?)
    }

    /// Compacts the selected stores.
    pub fn compact(
        &self,
        selection: &str,
        cancel: &CancelToken,
    ) -> Result<TaskReport<BTreeMap<String, binvault_store::CompactionStats>>> {
        self.run_task(&CompactBlobStoreTask::new(), selection, cancel)
    }

    /// Reclaims soft-deleted blobs, optionally overriding retention.
    pub fn purge(
        &self,
        selection: &str,
        retention: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<TaskReport<binvault_store::CompactionStats>> {
        let task = match retention {
            Some(retention) => PurgeSoftDeletedBlobsTask::with_retention(retention),
            None => PurgeSoftDeletedBlobsTask::new(),
        };
        self.run_task(&task, selection, cancel)
    }

    /// Recounts size metrics of the selected stores.
    pub fn recalculate(
        &self,
        selection: &str,
        cancel: &CancelToken,
    ) -> Result<TaskReport<BTreeMap<String, binvault_store::BlobStoreMetrics>>> {
        self.run_task(&RecalculateMetricsTask::new(), selection, cancel)
    }

    /// Blobs created in the last `hours` in a file store, oldest first.
    pub fn walk(&self, store: &str, hours: u64) -> Result<Vec<(BlobId, DateTime<Utc>)>> {
        let Some(config) = self.manager.configuration(store) else {
            bail!("Unknown blob store: {}", store);
        };
        if config.store_type != BlobStoreType::File {
            bail!("Store '{}' is a {} store; walk needs a file store", store, config.store_type);
        }
        let file_config =
            FileBlobStoreConfig::from_configuration(&config, &self.config.manager_config().blob_root)?;
        let walker = DateBasedWalker::since(&file_config.root, Duration::from_secs(hours * 3600));
        let mut found: Vec<(BlobId, DateTime<Utc>)> = walker.collect().into_iter().collect();
        found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(found)
    }

    /// Stops every store.
    pub fn shutdown(&self) -> Result<()> {
        self.manager.stop()?;
        Ok(())
    }
}
