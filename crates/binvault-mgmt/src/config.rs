//! Admin tool configuration file.

use binvault_store::{ManagerConfig, ParallelTaskConfig, SoftDeleteIndexConfig, DEFAULT_STORE_NAME};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Admin tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    /// Base directory for relative paths below.
    pub data_dir: PathBuf,
    /// JSON file holding the store configurations.
    pub stores_file: PathBuf,
    /// Directory relative file-store paths resolve against.
    pub blob_root: PathBuf,
    /// Provision a default file store when none is configured.
    pub provision_defaults: bool,
    /// Name of the provisioned store.
    pub default_store_name: String,
    /// Soft-delete index tuning.
    pub soft_delete: SoftDeleteIndexConfig,
    /// Maintenance worker pool settings.
    pub tasks: ParallelTaskConfig,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/binvault"),
            stores_file: PathBuf::from("stores.json"),
            blob_root: PathBuf::from("blobs"),
            provision_defaults: true,
            default_store_name: DEFAULT_STORE_NAME.to_string(),
            soft_delete: SoftDeleteIndexConfig::default(),
            tasks: ParallelTaskConfig::default(),
        }
    }
}

impl MgmtConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: MgmtConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: MgmtConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    /// Absolute location of the store configuration file.
    pub fn stores_path(&self) -> PathBuf {
        self.resolve(&self.stores_file)
    }

    /// Settings for the store manager.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            blob_root: self.resolve(&self.blob_root),
            provision_defaults: self.provision_defaults,
            default_store_name: self.default_store_name.clone(),
            soft_delete: self.soft_delete.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MgmtConfig::default();
        assert_eq!(config.stores_path(), PathBuf::from("/var/lib/binvault/stores.json"));
        assert_eq!(
            config.manager_config().blob_root,
            PathBuf::from("/var/lib/binvault/blobs")
        );
        assert!(config.provision_defaults);
        assert_eq!(config.default_store_name, "default");
        assert_eq!(config.tasks.max_threads, 4);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "data_dir": "/srv/vault",
                "blob_root": "/mnt/blobs",
                "provision_defaults": false,
                "tasks": {{ "max_threads": 8, "queue_capacity": 16, "progress_interval_secs": 5, "poll_interval_ms": 20 }}
            }}"#
        )
        .unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stores_path(), PathBuf::from("/srv/vault/stores.json"));
        assert_eq!(config.manager_config().blob_root, PathBuf::from("/mnt/blobs"));
        assert!(!config.manager_config().provision_defaults);
        assert_eq!(config.tasks.max_threads, 8);
        assert_eq!(config.soft_delete.batch_limit, 1000);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
data_dir = "/toml/vault"
default_store_name = "main"

[soft_delete]
batch_limit = 50
delete_batch = 10
"#
        )
        .unwrap();

        let config = MgmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/toml/vault"));
        assert_eq!(config.default_store_name, "main");
        assert_eq!(config.soft_delete.batch_limit, 50);
        assert_eq!(config.manager_config().soft_delete.delete_batch, 10);
        assert!(config.provision_defaults);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MgmtConfig::from_file(file.path()).is_err());
    }
}
