//! Registry and lifecycle of configured blob stores.
//!
//! The manager builds each store from its configuration, wraps it with the
//! metering and freeze decorators, and tracks its lifecycle state. Stores
//! start leaves first, then groups once all their members are up; a store
//! that fails to start is left out of the registry.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config_store::BlobStoreConfigurationStore;
use crate::error::{StoreError, StoreResult};
use crate::file_store::{FileBlobStore, FileBlobStoreConfig, PATH_ATTR};
use crate::freeze::{FreezeService, LocalFreezeService};
use crate::group::{member_names, GroupBlobStore};
use crate::interceptor::{FreezeGuardedBlobStore, MeteredBlobStore};
use crate::metrics::OperationMetricsRegistry;
use crate::object_client::ObjectStorageClient;
use crate::object_store::{ObjectBlobStore, ObjectBlobStoreConfig};
use crate::soft_delete::{InMemorySoftDeletedBlobDao, SoftDeleteIndexConfig, SoftDeletedBlobDao};
use crate::store::{BlobStore, BlobStoreConfiguration, BlobStoreType, StoreState};
use crate::task::StoreLookup;

/// Name of the store provisioned when nothing is configured.
pub const DEFAULT_STORE_NAME: &str = "default";

/// Manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory relative file store paths resolve against (default: "blobs").
    pub blob_root: PathBuf,
    /// Create a default file store on first start (default: true).
    pub provision_defaults: bool,
    /// Name of the provisioned store (default: "default").
    pub default_store_name: String,
    /// Soft-delete index tuning shared by all stores.
    #[serde(default)]
    pub soft_delete: SoftDeleteIndexConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            blob_root: PathBuf::from("blobs"),
            provision_defaults: true,
            default_store_name: DEFAULT_STORE_NAME.to_string(),
            soft_delete: SoftDeleteIndexConfig::default(),
        }
    }
}

/// Where a store keeps its data. No two stores may share or nest one.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreLocation {
    Directory(PathBuf),
    Objects { bucket: String, prefix: String },
}

impl StoreLocation {
    fn overlaps(&self, other: &StoreLocation) -> bool {
        match (self, other) {
            (StoreLocation::Directory(a), StoreLocation::Directory(b)) => {
                a.starts_with(b) || b.starts_with(a)
            }
            (
                StoreLocation::Objects { bucket: a, prefix: pa },
                StoreLocation::Objects { bucket: b, prefix: pb },
            ) => a == b && (pa.starts_with(pb.as_str()) || pb.starts_with(pa.as_str())),
            _ => false,
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Directory(path) => write!(f, "directory {}", path.display()),
            StoreLocation::Objects { bucket, prefix } => {
                write!(f, "bucket '{}' prefix '{}'", bucket, prefix)
            }
        }
    }
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Clone)]
struct ManagedStore {
    config: BlobStoreConfiguration,
    store: Arc<dyn BlobStore>,
}

/// Orders configurations so every group comes after all of its members.
///
/// Leaf stores come first in name order. Groups whose members can never be
/// satisfied (missing or cyclic) are appended last and will fail to build.
pub fn start_sequence(configs: &[BlobStoreConfiguration]) -> Vec<BlobStoreConfiguration> {
    let mut ordered: Vec<BlobStoreConfiguration> = configs
        .iter()
        .filter(|c| c.store_type != BlobStoreType::Group)
        .cloned()
        .collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));
    let mut placed: HashSet<String> = ordered.iter().map(|c| c.name.clone()).collect();

    let mut pending: Vec<&BlobStoreConfiguration> = configs
        .iter()
        .filter(|c| c.store_type == BlobStoreType::Group)
        .collect();
    pending.sort_by(|a, b| a.name.cmp(&b.name));
    loop {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|g| member_names(g).iter().all(|m| placed.contains(m)));
        if ready.is_empty() {
            ordered.extend(blocked.into_iter().cloned());
            break;
        }
        for group in ready {
            placed.insert(group.name.clone());
            ordered.push(group.clone());
        }
        pending = blocked;
    }
    ordered
}

/// Owns every configured store.
pub struct BlobStoreManager {
    config: ManagerConfig,
    config_store: Arc<dyn BlobStoreConfigurationStore>,
    dao: Arc<dyn SoftDeletedBlobDao>,
    object_client: Option<Arc<dyn ObjectStorageClient>>,
    freeze: Arc<dyn FreezeService>,
    metrics: Arc<OperationMetricsRegistry>,
    stores: DashMap<String, ManagedStore>,
    states: DashMap<String, StoreState>,
    start_order: Mutex<Vec<String>>,
    lifecycle: Mutex<()>,
}

impl BlobStoreManager {
    /// Creates a manager with in-memory collaborators; see the `with_*` methods.
    pub fn new(config: ManagerConfig, config_store: Arc<dyn BlobStoreConfigurationStore>) -> Self {
        Self {
            config,
            config_store,
            dao: Arc::new(InMemorySoftDeletedBlobDao::new()),
            object_client: None,
            freeze: Arc::new(LocalFreezeService::new()),
            metrics: Arc::new(OperationMetricsRegistry::new()),
            stores: DashMap::new(),
            states: DashMap::new(),
            start_order: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Uses `dao` for every store's soft-delete index.
    pub fn with_dao(mut self, dao: Arc<dyn SoftDeletedBlobDao>) -> Self {
        self.dao = dao;
        self
    }

    /// Uses `client` for object-storage stores. Without one, S3 stores fail
    /// to build.
    pub fn with_object_client(mut self, client: Arc<dyn ObjectStorageClient>) -> Self {
        self.object_client = Some(client);
        self
    }

    /// Uses `freeze` to gate mutations.
    pub fn with_freeze_service(mut self, freeze: Arc<dyn FreezeService>) -> Self {
        self.freeze = freeze;
        self
    }

    /// Records operation counters into `metrics`.
    pub fn with_metrics_registry(mut self, metrics: Arc<OperationMetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Operation counters of every store.
    pub fn metrics_registry(&self) -> &Arc<OperationMetricsRegistry> {
        &self.metrics
    }

    /// The freeze gate.
    pub fn freeze_service(&self) -> &Arc<dyn FreezeService> {
        &self.freeze
    }

    fn wrap<S: BlobStore + 'static>(&self, store: S) -> Arc<dyn BlobStore> {
        let metrics = self.metrics.for_store(store.name());
        Arc::new(FreezeGuardedBlobStore::new(
            MeteredBlobStore::new(store, metrics),
            self.freeze.clone(),
        ))
    }

    fn build(&self, config: &BlobStoreConfiguration) -> StoreResult<Arc<dyn BlobStore>> {
        let soft_delete = self.config.soft_delete.clone();
        match config.store_type {
            BlobStoreType::File => {
                let file_config =
                    FileBlobStoreConfig::from_configuration(config, &self.config.blob_root)?;
                Ok(self.wrap(FileBlobStore::new(
                    config,
                    file_config,
                    self.dao.clone(),
                    soft_delete,
                )?))
            }
            BlobStoreType::S3 => {
                let client = self.object_client.clone().ok_or_else(|| {
                    StoreError::Configuration(format!(
                        "store '{}' needs object storage, but no client is configured",
                        config.name
                    ))
                })?;
                Ok(self.wrap(ObjectBlobStore::new(
                    config,
                    client,
                    self.dao.clone(),
                    soft_delete,
                )?))
            }
            BlobStoreType::Group => {
                let mut members = Vec::new();
                for name in member_names(config) {
                    let member = self.get(&name).ok_or_else(|| {
                        StoreError::Configuration(format!(
                            "group '{}' references unknown store '{}'",
                            config.name, name
                        ))
                    })?;
                    members.push(member);
                }
                Ok(self.wrap(GroupBlobStore::new(config, members)?))
            }
        }
    }

    fn location(&self, config: &BlobStoreConfiguration) -> StoreResult<Option<StoreLocation>> {
        match config.store_type {
            BlobStoreType::File => {
                let file = FileBlobStoreConfig::from_configuration(config, &self.config.blob_root)?;
                Ok(Some(StoreLocation::Directory(normalize(&file.root))))
            }
            BlobStoreType::S3 => {
                let object = ObjectBlobStoreConfig::from_configuration(config)?;
                Ok(Some(StoreLocation::Objects {
                    bucket: object.bucket,
                    prefix: object.prefix,
                }))
            }
            BlobStoreType::Group => Ok(None),
        }
    }

    /// Refuses a location equal to, inside, or containing another store's.
    fn check_location(&self, config: &BlobStoreConfiguration) -> StoreResult<()> {
        let Some(location) = self.location(config)? else {
            return Ok(());
        };
        for entry in self.stores.iter() {
            if entry.key() == &config.name {
                continue;
            }
            let Ok(Some(other)) = self.location(&entry.config) else {
                continue;
            };
            if location.overlaps(&other) {
                return Err(StoreError::Configuration(format!(
                    "store '{}' at {} overlaps store '{}' at {}",
                    config.name,
                    location,
                    entry.key(),
                    other
                )));
            }
        }
        Ok(())
    }

    /// Builds and starts a store; on failure no state is left behind.
    fn launch(&self, config: &BlobStoreConfiguration) -> StoreResult<Arc<dyn BlobStore>> {
        self.states.insert(config.name.clone(), StoreState::Starting);
        let result = self.build(config).and_then(|store| {
            store.start()?;
            Ok(store)
        });
        match &result {
            Ok(_) => {
                self.states.insert(config.name.clone(), StoreState::Started);
            }
            Err(err) => {
                self.states.remove(&config.name);
                error!("Failed to start blob store '{}': {}", config.name, err);
            }
        }
        result
    }

    fn register(&self, config: BlobStoreConfiguration, store: Arc<dyn BlobStore>) {
        let name = config.name.clone();
        self.stores.insert(name.clone(), ManagedStore { config, store });
        let mut order = self.start_order.lock();
        if !order.contains(&name) {
            order.push(name);
        }
    }

    fn entry(&self, name: &str) -> StoreResult<ManagedStore> {
        self.stores
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::StoreNotFound {
                name: name.to_string(),
            })
    }

    /// Loads every configuration and starts the stores.
    ///
    /// Provisions the default store when nothing is configured. Stores that
    /// fail to start are logged and stay unregistered.
    pub fn start(&self) -> StoreResult<()> {
        let _guard = self.lifecycle.lock();
        let mut configs = self.config_store.list()?;
        if configs.is_empty() && self.config.provision_defaults {
            let name = self.config.default_store_name.as_str();
            let default =
                BlobStoreConfiguration::new(name, BlobStoreType::File).with_attribute(PATH_ATTR, name);
            self.config_store.save(&default)?;
            info!("Provisioned default blob store '{}'", name);
            configs.push(default);
        }

        for config in &configs {
            if !self.stores.contains_key(&config.name) {
                self.states.insert(config.name.clone(), StoreState::Unconfigured);
            }
        }
        let mut started = 0usize;
        for config in start_sequence(&configs) {
            if self.stores.contains_key(&config.name) {
                continue;
            }
            if let Err(err) = self.check_location(&config) {
                error!("Not starting blob store '{}': {}", config.name, err);
                self.states.remove(&config.name);
                continue;
            }
            if let Ok(store) = self.launch(&config) {
                self.register(config, store);
                started += 1;
            }
        }
        info!("Started {} of {} blob stores", started, configs.len());
        Ok(())
    }

    /// Stops every store in reverse start order.
    pub fn stop(&self) -> StoreResult<()> {
        let _guard = self.lifecycle.lock();
        let order: Vec<String> = self.start_order.lock().drain(..).rev().collect();
        for name in order {
            let Some(store) = self.get(&name) else {
                continue;
            };
            self.states.insert(name.clone(), StoreState::Stopping);
            if let Err(err) = store.stop() {
                warn!("Failed to stop blob store '{}': {}", name, err);
            }
            self.states.insert(name, StoreState::Stopped);
        }
        info!("Stopped all blob stores");
        Ok(())
    }

    fn is_ancestor(&self, candidate: &str, of: &str) -> bool {
        let mut current = self.get_parent(of);
        let mut seen = HashSet::new();
        while let Some(parent) = current {
            if parent == candidate {
                return true;
            }
            if !seen.insert(parent.clone()) {
                return false;
            }
            current = self.get_parent(&parent);
        }
        false
    }

    fn validate_group(&self, config: &BlobStoreConfiguration) -> StoreResult<Vec<String>> {
        let members = member_names(config);
        if members.is_empty() {
            return Err(StoreError::Configuration(format!(
                "group '{}' has no members",
                config.name
            )));
        }
        for member in &members {
            if member == &config.name || self.is_ancestor(member, &config.name) {
                return Err(StoreError::Configuration(format!(
                    "group '{}' cannot contain '{}': membership would form a cycle",
                    config.name, member
                )));
            }
            let entry = self.entry(member).map_err(|_| {
                StoreError::Configuration(format!(
                    "group '{}' references unknown store '{}'",
                    config.name, member
                ))
            })?;
            if let Some(parent) = entry.config.parent_group {
                if parent != config.name {
                    return Err(StoreError::Configuration(format!(
                        "store '{}' is already a member of group '{}'",
                        member, parent
                    )));
                }
            }
        }
        Ok(members)
    }

    fn set_parent(&self, member: &str, parent: Option<&str>) -> StoreResult<()> {
        let mut entry = self.entry(member)?;
        entry.config.parent_group = parent.map(str::to_string);
        self.config_store.save(&entry.config)?;
        self.stores.insert(member.to_string(), entry);
        Ok(())
    }

    /// Creates, starts and persists a new store.
    pub fn create(&self, config: BlobStoreConfiguration) -> StoreResult<Arc<dyn BlobStore>> {
        self.freeze.check_writable("create blob store")?;
        let _guard = self.lifecycle.lock();
        config.validate_name()?;
        if self.stores.contains_key(&config.name) {
            return Err(StoreError::Configuration(format!(
                "a blob store named '{}' already exists",
                config.name
            )));
        }
        let mut config = config;
        config.parent_group = None;
        self.check_location(&config)?;
        let members = match config.store_type {
            BlobStoreType::Group => self.validate_group(&config)?,
            _ => Vec::new(),
        };

        let store = self.launch(&config)?;
        if let Err(err) = self.config_store.save(&config) {
            self.abandon(&config.name, &store, &[], false);
            return Err(err);
        }
        let mut claimed = Vec::with_capacity(members.len());
        for member in &members {
            if let Err(err) = self.set_parent(member, Some(&config.name)) {
                self.abandon(&config.name, &store, &claimed, true);
                return Err(err);
            }
            claimed.push(member.clone());
        }
        info!("Created {} blob store '{}'", config.store_type, config.name);
        self.register(config, store.clone());
        Ok(store)
    }

    /// Undoes a partially applied `create`: releases claimed members, removes
    /// the saved configuration and stops the new instance.
    fn abandon(&self, name: &str, store: &Arc<dyn BlobStore>, claimed: &[String], saved: bool) {
        for member in claimed {
            if let Err(err) = self.set_parent(member, None) {
                warn!("Failed to release member '{}' of abandoned '{}': {}", member, name, err);
            }
        }
        if saved {
            if let Err(err) = self.config_store.delete(name) {
                warn!("Failed to remove configuration of abandoned '{}': {}", name, err);
            }
        }
        if let Err(err) = store.stop() {
            warn!("Failed to stop abandoned '{}': {}", name, err);
        }
        self.states.remove(name);
        self.metrics.remove(name);
    }

    /// Replaces a store's configuration and restarts it.
    ///
    /// If the new configuration fails to start, the previous instance is
    /// restarted and stays registered.
    pub fn update(&self, config: BlobStoreConfiguration) -> StoreResult<Arc<dyn BlobStore>> {
        self.freeze.check_writable("update blob store")?;
        let _guard = self.lifecycle.lock();
        let existing = self.entry(&config.name)?;
        if existing.config.store_type != config.store_type {
            return Err(StoreError::Configuration(format!(
                "cannot change type of store '{}' from {} to {}",
                config.name, existing.config.store_type, config.store_type
            )));
        }
        let mut config = config;
        config.parent_group = existing.config.parent_group.clone();
        self.check_location(&config)?;
        let members = match config.store_type {
            BlobStoreType::Group => self.validate_group(&config)?,
            _ => Vec::new(),
        };

        self.states.insert(config.name.clone(), StoreState::Stopping);
        existing.store.stop()?;
        let restore = |err: StoreError| {
            match existing.store.start() {
                Ok(()) => {
                    self.states.insert(config.name.clone(), StoreState::Started);
                }
                Err(restart_err) => {
                    error!("Failed to restart '{}' after failed update: {}", config.name, restart_err);
                    self.states.insert(config.name.clone(), StoreState::Stopped);
                }
            }
            err
        };
        let store = self.launch(&config).map_err(&restore)?;
        if let Err(err) = self.config_store.save(&config) {
            if let Err(stop_err) = store.stop() {
                warn!("Failed to stop new '{}' instance: {}", config.name, stop_err);
            }
            return Err(restore(err));
        }

        if config.store_type == BlobStoreType::Group {
            for old in member_names(&existing.config) {
                if !members.contains(&old) {
                    self.set_parent(&old, None)?;
                }
            }
            for member in &members {
                self.set_parent(member, Some(&config.name))?;
            }
        }
        let parent = config.parent_group.clone();
        self.stores.insert(
            config.name.clone(),
            ManagedStore {
                config,
                store: store.clone(),
            },
        );
        if let Some(parent) = parent {
            self.rebuild_group(&parent)?;
        }
        Ok(store)
    }

    /// Rebuilds a group so it picks up replaced member instances.
    fn rebuild_group(&self, name: &str) -> StoreResult<()> {
        let entry = self.entry(name)?;
        let store = self.launch(&entry.config)?;
        debug!("Rebuilt group '{}' after member update", name);
        let parent = entry.config.parent_group.clone();
        self.stores.insert(
            name.to_string(),
            ManagedStore {
                config: entry.config,
                store,
            },
        );
        match parent {
            Some(parent) => self.rebuild_group(&parent),
            None => Ok(()),
        }
    }

    /// Deletes a store and its data.
    ///
    /// Group members are refused. The soft-delete index is cleared, the
    /// backend torn down, then the configuration removed; if any step fails
    /// the store stays registered so the delete can be retried.
    pub fn delete(&self, name: &str) -> StoreResult<()> {
        self.freeze.check_writable("delete blob store")?;
        let _guard = self.lifecycle.lock();
        let entry = self.entry(name)?;
        if let Some(group) = &entry.config.parent_group {
            return Err(StoreError::Configuration(format!(
                "blob store '{}' is a member of group '{}'; remove it from the group before deleting it",
                name, group
            )));
        }

        if let Some(index) = entry.store.soft_delete_index() {
            index.delete_all_records()?;
        }
        self.states.insert(name.to_string(), StoreState::Stopping);
        let teardown = entry
            .store
            .stop()
            .and_then(|_| entry.store.remove())
            .and_then(|_| self.config_store.delete(name).map(|_| ()));
        if let Err(err) = teardown {
            error!("Failed to delete blob store '{}': {}", name, err);
            let state = match entry.store.start() {
                Ok(()) => StoreState::Started,
                Err(_) => StoreState::Stopped,
            };
            self.states.insert(name.to_string(), state);
            return Err(err);
        }

        if entry.config.store_type == BlobStoreType::Group {
            for member in member_names(&entry.config) {
                if let Err(err) = self.set_parent(&member, None) {
                    warn!("Failed to release member '{}' of '{}': {}", member, name, err);
                }
            }
        }
        self.stores.remove(name);
        self.states.remove(name);
        self.metrics.remove(name);
        self.start_order.lock().retain(|n| n != name);
        info!("Deleted blob store '{}'", name);
        Ok(())
    }

    /// The named store, if registered.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.stores.get(name).map(|e| e.store.clone())
    }

    /// The named store as a direct write target.
    ///
    /// Group members are refused: writes must go through their group.
    pub fn get_writable(&self, name: &str) -> StoreResult<Arc<dyn BlobStore>> {
        self.freeze.check_writable("write blob")?;
        let entry = self.entry(name)?;
        if let Some(group) = &entry.config.parent_group {
            return Err(StoreError::Configuration(format!(
                "blob store '{}' is a member of group '{}' and cannot be written directly",
                name, group
            )));
        }
        match self.state(name) {
            Some(StoreState::Started) => Ok(entry.store),
            other => Err(StoreError::InvalidState {
                store: name.to_string(),
                state: other.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
            }),
        }
    }

    /// Every registered store, ordered by name.
    pub fn browse(&self) -> Vec<Arc<dyn BlobStore>> {
        let mut stores: Vec<Arc<dyn BlobStore>> =
            self.stores.iter().map(|e| e.store.clone()).collect();
        stores.sort_by(|a, b| a.name().cmp(b.name()));
        stores
    }

    /// The group a store belongs to.
    pub fn get_parent(&self, name: &str) -> Option<String> {
        self.stores
            .get(name)
            .and_then(|e| e.config.parent_group.clone())
    }

    /// Whether a store is a group member.
    pub fn is_member(&self, name: &str) -> bool {
        self.get_parent(name).is_some()
    }

    /// Persisted configuration of a registered store.
    pub fn configuration(&self, name: &str) -> Option<BlobStoreConfiguration> {
        self.stores.get(name).map(|e| e.config.clone())
    }

    /// Lifecycle state of a store.
    pub fn state(&self, name: &str) -> Option<StoreState> {
        self.states.get(name).map(|s| *s)
    }

    /// Names of stores currently in `state`, sorted.
    pub fn stores_in_state(&self, state: StoreState) -> Vec<String> {
        let mut names: Vec<String> = self
            .states
            .iter()
            .filter(|e| *e.value() == state)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl StoreLookup for BlobStoreManager {
    fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.get(name)
    }
}
