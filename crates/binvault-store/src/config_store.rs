//! Persistence of store configurations.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::BlobStoreConfiguration;

/// Source of truth for configured stores.
pub trait BlobStoreConfigurationStore: Send + Sync {
    /// Every persisted configuration, ordered by name.
    fn list(&self) -> StoreResult<Vec<BlobStoreConfiguration>>;
    /// Inserts or replaces a configuration.
    fn save(&self, config: &BlobStoreConfiguration) -> StoreResult<()>;
    /// Removes a configuration; returns whether it existed.
    fn delete(&self, name: &str) -> StoreResult<bool>;
}

/// Configurations held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlobStoreConfigurationStore {
    configs: Mutex<BTreeMap<String, BlobStoreConfiguration>>,
    fail_next_delete: AtomicBool,
    fail_save_of: Mutex<Option<String>>,
}

impl InMemoryBlobStoreConfigurationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `delete` fail with an I/O error.
    pub fn fail_next_delete(&self) {
        self.fail_next_delete.store(true, Ordering::SeqCst);
    }

    /// Makes the next `save` of the named configuration fail with an I/O error.
    pub fn fail_next_save_of(&self, name: &str) {
        *self.fail_save_of.lock() = Some(name.to_string());
    }
}

impl BlobStoreConfigurationStore for InMemoryBlobStoreConfigurationStore {
    fn list(&self) -> StoreResult<Vec<BlobStoreConfiguration>> {
        Ok(self.configs.lock().values().cloned().collect())
    }

    fn save(&self, config: &BlobStoreConfiguration) -> StoreResult<()> {
        {
            let mut fail = self.fail_save_of.lock();
            if fail.as_deref() == Some(config.name.as_str()) {
                *fail = None;
                return Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected failure saving configuration '{}'", config.name),
                )));
            }
        }
        self.configs
            .lock()
            .insert(config.name.clone(), config.clone());
        Ok(())
    }

    fn delete(&self, name: &str) -> StoreResult<bool> {
        if self.fail_next_delete.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure deleting configuration '{}'", name),
            )));
        }
        Ok(self.configs.lock().remove(name).is_some())
    }
}

/// Configurations persisted as a JSON array in one file.
#[derive(Debug)]
pub struct JsonFileConfigurationStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileConfigurationStore {
    /// Uses `path`; the file is created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> StoreResult<BTreeMap<String, BlobStoreConfiguration>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let configs: Vec<BlobStoreConfiguration> = serde_json::from_str(&text)?;
        Ok(configs.into_iter().map(|c| (c.name.clone(), c)).collect())
    }

    fn write_all(&self, configs: &BTreeMap<String, BlobStoreConfiguration>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let list: Vec<&BlobStoreConfiguration> = configs.values().collect();
        let json = serde_json::to_vec_pretty(&list)?;
        let mut tmp = self.path.clone();
        tmp.set_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} store configurations to {}", list.len(), self.path.display());
        Ok(())
    }
}

impl BlobStoreConfigurationStore for JsonFileConfigurationStore {
    fn list(&self) -> StoreResult<Vec<BlobStoreConfiguration>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.into_values().collect())
    }

    fn save(&self, config: &BlobStoreConfiguration) -> StoreResult<()> {
        let _guard = self.lock.lock();
        let mut configs = self.read_all()?;
        configs.insert(config.name.clone(), config.clone());
        self.write_all(&configs)
    }

    fn delete(&self, name: &str) -> StoreResult<bool> {
        let _guard = self.lock.lock();
        let mut configs = self.read_all()?;
        if configs.remove(name).is_none() {
            return Ok(false);
        }
        self.write_all(&configs)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlobStoreType;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_save_list_delete() {
        let store = InMemoryBlobStoreConfigurationStore::new();
        store
            .save(&BlobStoreConfiguration::new("b", BlobStoreType::File))
            .unwrap();
        store
            .save(&BlobStoreConfiguration::new("a", BlobStoreType::S3))
            .unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        store.fail_next_delete();
        assert!(store.delete("a").is_err());
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
    }

    #[test]
    fn test_json_file_persists_between_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("stores.json");
        {
            let store = JsonFileConfigurationStore::new(&path);
            assert!(store.list().unwrap().is_empty());
            store
                .save(
                    &BlobStoreConfiguration::new("default", BlobStoreType::File)
                        .with_attribute("path", "default"),
                )
                .unwrap();
        }
        let reopened = JsonFileConfigurationStore::new(&path);
        let configs = reopened.list().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].attribute("path"), Some("default"));
        assert!(reopened.delete("default").unwrap());
        assert!(reopened.list().unwrap().is_empty());
    }

    #[test]
    fn test_json_file_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stores.json");
        fs::write(&path, "not json").unwrap();
        let store = JsonFileConfigurationStore::new(&path);
        assert!(matches!(
            store.list(),
            Err(StoreError::Serialization { .. })
        ));
    }
}
