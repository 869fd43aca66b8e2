//! Command line definition and dispatch.

use crate::admin::Admin;
use crate::config::MgmtConfig;
use anyhow::Result;
use binvault_store::{CancelToken, ALL_STORES};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// binvault admin command line.
#[derive(Parser)]
#[command(name = "binvault-mgmt")]
#[command(about = "binvault blob store administration", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "BINVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Command {
    /// Manage store configurations.
    Stores {
        /// Store action.
        #[command(subcommand)]
        cmd: StoresCmd,
    },
    /// Compact stores, reclaiming expired soft-deleted blobs.
    Compact {
        /// Comma-separated store names, or `*` for all.
        #[arg(default_value = ALL_STORES)]
        stores: String,
    },
    /// Reclaim soft-deleted blobs record by record.
    Purge {
        /// Comma-separated store names, or `*` for all.
        #[arg(default_value = ALL_STORES)]
        stores: String,
        /// Override each store's retention, in seconds.
        #[arg(long)]
        retention_secs: Option<u64>,
    },
    /// Recount blob counts and sizes.
    Recalculate {
        /// Comma-separated store names, or `*` for all.
        #[arg(default_value = ALL_STORES)]
        stores: String,
    },
    /// List blobs created recently in a file store.
    Walk {
        /// Window length in hours.
        #[arg(long, default_value = "1")]
        hours: u64,
        /// File store to walk.
        #[arg(long)]
        store: String,
    },
}

/// Store configuration actions.
#[derive(Subcommand, Clone)]
pub enum StoresCmd {
    /// Show every store.
    List,
    /// Create a store.
    Create {
        /// Store name.
        name: String,
        /// Backend type: file or group. s3 needs an embedding that supplies an object storage client.
        #[arg(long = "type", default_value = "file")]
        store_type: String,
        /// Attribute as key=value; repeatable.
        #[arg(short = 'a', long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },
    /// Delete a store and its data.
    Delete {
        /// Store name.
        name: String,
    },
}

fn parse_attribute(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

impl Cli {
    fn load_config(&self) -> Result<MgmtConfig> {
        match &self.config {
            Some(path) => MgmtConfig::from_file(path),
            None => {
                tracing::warn!("No config file given, using defaults");
                Ok(MgmtConfig::default())
            }
        }
    }

    /// Runs the command; `cancel` stops maintenance runs early.
    pub async fn run(self, cancel: CancelToken) -> Result<()> {
        let config = self.load_config()?;
        let admin = Arc::new(tokio::task::spawn_blocking(move || Admin::open(config)).await??);
        let result = match self.command {
            Command::Stores { ref cmd } => Self::stores(&admin, cmd),
            Command::Compact { stores } => {
                let report = blocking(&admin, move |admin| admin.compact(&stores, &cancel)).await?;
                println!("{:<20} {:>10} {:>10} {:>10} {:>15}", "STORE", "EXAMINED", "RECLAIMED", "RETAINED", "BYTES");
                println!("{}", "-".repeat(69));
                for (store, stats) in &report.output {
                    println!(
                        "{:<20} {:>10} {:>10} {:>10} {:>15}",
                        store,
                        stats.examined,
                        stats.reclaimed,
                        stats.retained,
                        format_bytes(stats.bytes_reclaimed)
                    );
                }
                Ok(())
            }
            Command::Purge {
                stores,
                retention_secs,
            } => {
                let retention = retention_secs.map(Duration::from_secs);
                let report =
                    blocking(&admin, move |admin| admin.purge(&stores, retention, &cancel)).await?;
                println!("Stores: {}", report.stores.join(", "));
                println!("Examined: {}", report.output.examined);
                println!("Reclaimed: {}", report.output.reclaimed);
                println!("Retained: {}", report.output.retained);
                println!("Freed: {}", format_bytes(report.output.bytes_reclaimed));
                println!("Failed units: {}", report.units_failed);
                Ok(())
            }
            Command::Recalculate { stores } => {
                let report =
                    blocking(&admin, move |admin| admin.recalculate(&stores, &cancel)).await?;
                println!("{:<20} {:>12} {:>15}", "STORE", "BLOBS", "SIZE");
                println!("{}", "-".repeat(49));
                for (store, metrics) in &report.output {
                    println!(
                        "{:<20} {:>12} {:>15}",
                        store,
                        metrics.blob_count,
                        format_bytes(metrics.total_size)
                    );
                }
                Ok(())
            }
            Command::Walk { hours, store } => {
                let found = admin.walk(&store, hours)?;
                for (blob_id, created) in &found {
                    println!("{}  {}", created.format("%Y-%m-%d %H:%M"), blob_id);
                }
                println!("{} blobs in the last {}h of '{}'", found.len(), hours, store);
                Ok(())
            }
        };
        let stopped = admin.shutdown();
        result.and(stopped)
    }

    fn stores(admin: &Admin, cmd: &StoresCmd) -> Result<()> {
        match cmd {
            StoresCmd::List => {
                println!(
                    "{:<20} {:<8} {:<10} {:<15} {:>10} {:>15}",
                    "NAME", "TYPE", "STATE", "GROUP", "BLOBS", "SIZE"
                );
                println!("{}", "-".repeat(83));
                for row in admin.list_stores() {
                    println!(
                        "{:<20} {:<8} {:<10} {:<15} {:>10} {:>15}",
                        row.name,
                        row.store_type.to_string(),
                        row.state,
                        row.group.unwrap_or_else(|| "-".to_string()),
                        row.blob_count,
                        format_bytes(row.total_size)
                    );
                }
                Ok(())
            }
            StoresCmd::Create {
                name,
                store_type,
                attributes,
            } => {
                admin.create_store(name, store_type, attributes)?;
                println!("Created {} store '{}'", store_type, name);
                Ok(())
            }
            StoresCmd::Delete { name } => {
                admin.delete_store(name)?;
                println!("Deleted store '{}'", name);
                Ok(())
            }
        }
    }
}

async fn blocking<T, F>(admin: &Arc<Admin>, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Admin) -> Result<T> + Send + 'static,
{
    let admin = admin.clone();
    tokio::task::spawn_blocking(move || job(&admin)).await?
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stores_create() {
        let cli = Cli::try_parse_from([
            "binvault-mgmt",
            "stores",
            "create",
            "bulk",
            "--type",
            "s3",
            "-a",
            "bucket=artifacts",
            "--attr",
            "prefix = team/",
        ])
        .unwrap();
        match cli.command {
            Command::Stores {
                cmd:
                    StoresCmd::Create {
                        name,
                        store_type,
                        attributes,
                    },
            } => {
                assert_eq!(name, "bulk");
                assert_eq!(store_type, "s3");
                assert_eq!(
                    attributes,
                    vec![
                        ("bucket".to_string(), "artifacts".to_string()),
                        ("prefix".to_string(), "team/".to_string())
                    ]
                );
            }
            _ => panic!("expected stores create"),
        }
    }

    #[test]
    fn test_parse_maintenance_defaults() {
        let cli = Cli::try_parse_from(["binvault-mgmt", "purge", "--retention-secs", "60"]).unwrap();
        match cli.command {
            Command::Purge {
                stores,
                retention_secs,
            } => {
                assert_eq!(stores, "*");
                assert_eq!(retention_secs, Some(60));
            }
            _ => panic!("expected purge"),
        }
        assert!(Cli::try_parse_from(["binvault-mgmt", "stores", "create", "x", "-a", "novalue"]).is_err());
        assert!(Cli::try_parse_from(["binvault-mgmt", "walk"]).is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
