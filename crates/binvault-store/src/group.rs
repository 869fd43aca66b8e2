//! Virtual store fanning out to member stores.
//!
//! Writes go to one member chosen by the fill policy; reads and deletes are
//! routed to whichever member holds the blob. The group owns no data and no
//! soft-delete index of its own.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::{Blob, BlobHeaders, BlobId, BlobRecord};
use crate::cancel::CancelToken;
use crate::error::{StoreError, StoreResult};
use crate::metrics::BlobStoreMetrics;
use crate::soft_delete::SoftDeletedBlobIndex;
use crate::store::{BlobStore, BlobStoreConfiguration, BlobStoreType, CompactionStats, ReclaimOutcome};

/// Attribute listing member store names, comma separated.
pub const MEMBERS_ATTR: &str = "members";
/// Attribute selecting the fill policy.
pub const FILL_POLICY_ATTR: &str = "fill_policy";

/// How a group picks the member that receives a new blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillPolicy {
    /// Rotate through writable members.
    #[default]
    RoundRobin,
    /// Always the first writable member.
    WriteToFirst,
}

impl FillPolicy {
    /// Parses the persisted policy name.
    pub fn parse(value: &str) -> StoreResult<Self> {
        match value.trim() {
            "" | "roundRobin" => Ok(FillPolicy::RoundRobin),
            "writeToFirst" => Ok(FillPolicy::WriteToFirst),
            other => Err(StoreError::Configuration(format!(
                "unknown fill policy '{}'",
                other
            ))),
        }
    }
}

/// Member names listed in a group configuration, in order, without duplicates.
pub fn member_names(config: &BlobStoreConfiguration) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in config
        .attribute(MEMBERS_ATTR)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
    {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Group of member stores behind one name.
pub struct GroupBlobStore {
    name: String,
    members: Vec<Arc<dyn BlobStore>>,
    policy: FillPolicy,
    next: AtomicUsize,
}

impl GroupBlobStore {
    /// Creates a group over already started members.
    pub fn new(
        configuration: &BlobStoreConfiguration,
        members: Vec<Arc<dyn BlobStore>>,
    ) -> StoreResult<Self> {
        if members.is_empty() {
            return Err(StoreError::Configuration(format!(
                "group '{}' has no members",
                configuration.name
            )));
        }
        let policy = FillPolicy::parse(configuration.attribute(FILL_POLICY_ATTR).unwrap_or(""))?;
        Ok(Self {
            name: configuration.name.clone(),
            members,
            policy,
            next: AtomicUsize::new(0),
        })
    }

    /// The configured fill policy.
    pub fn policy(&self) -> FillPolicy {
        self.policy
    }

    /// Members in the order writes should try them.
    fn write_order(&self) -> Vec<&Arc<dyn BlobStore>> {
        let writable: Vec<&Arc<dyn BlobStore>> =
            self.members.iter().filter(|m| m.is_writable()).collect();
        if writable.is_empty() {
            return writable;
        }
        let start = match self.policy {
            FillPolicy::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % writable.len(),
            FillPolicy::WriteToFirst => 0,
        };
        writable[start..]
            .iter()
            .chain(writable[..start].iter())
            .copied()
            .collect()
    }

    fn locate(&self, blob_id: &BlobId) -> StoreResult<Option<&Arc<dyn BlobStore>>> {
        for member in &self.members {
            if member.exists(blob_id)? {
                return Ok(Some(member));
            }
        }
        Ok(None)
    }

    fn located(&self, blob_id: &BlobId) -> StoreResult<&Arc<dyn BlobStore>> {
        self.locate(blob_id)?.ok_or_else(|| StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        })
    }
}

impl BlobStore for GroupBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn store_type(&self) -> BlobStoreType {
        BlobStoreType::Group
    }

    fn start(&self) -> StoreResult<()> {
        info!(
            "Started group '{}' over {} members ({:?})",
            self.name,
            self.members.len(),
            self.policy
        );
        Ok(())
    }

    fn stop(&self) -> StoreResult<()> {
        Ok(())
    }

    fn create(&self, payload: Bytes, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        let mut last_err = None;
        for member in self.write_order() {
            match member.create(payload.clone(), headers.clone()) {
                Ok(record) => {
                    debug!(
                        "Group '{}' wrote {} to member '{}'",
                        self.name,
                        record.blob_id,
                        member.name()
                    );
                    return Ok(record);
                }
                Err(err @ StoreError::QuotaExceeded { .. }) => {
                    debug!("Member '{}' is full: {}", member.name(), err);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::InvalidState {
            store: self.name.clone(),
            state: "no writable member".to_string(),
        }))
    }

    fn copy(&self, blob_id: &BlobId, headers: BlobHeaders) -> StoreResult<BlobRecord> {
        self.located(blob_id)?.copy(blob_id, headers)
    }

    fn get(&self, blob_id: &BlobId) -> StoreResult<Blob> {
        for member in &self.members {
            match member.get(blob_id) {
                Ok(blob) => return Ok(blob),
                Err(StoreError::BlobNotFound { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::BlobNotFound {
            blob_id: blob_id.clone(),
        })
    }

    fn exists(&self, blob_id: &BlobId) -> StoreResult<bool> {
        Ok(self.locate(blob_id)?.is_some())
    }

    fn soft_delete(&self, blob_id: &BlobId, reason: &str) -> StoreResult<bool> {
        self.located(blob_id)?.soft_delete(blob_id, reason)
    }

    fn undelete(&self, blob_id: &BlobId) -> StoreResult<bool> {
        self.located(blob_id)?.undelete(blob_id)
    }

    fn delete_hard(&self, blob_id: &BlobId) -> StoreResult<bool> {
        match self.locate(blob_id)? {
            Some(member) => member.delete_hard(blob_id),
            None => Ok(false),
        }
    }

    fn reclaim(&self, blob_id: &BlobId, retention: Duration) -> StoreResult<ReclaimOutcome> {
        match self.locate(blob_id)? {
            Some(member) => member.reclaim(blob_id, retention),
            None => Ok(ReclaimOutcome::Skipped),
        }
    }

    fn compact(&self, cancel: &CancelToken) -> StoreResult<CompactionStats> {
        let mut total = CompactionStats::default();
        for member in &self.members {
            cancel.check("compact group")?;
            total.merge(&member.compact(cancel)?);
        }
        Ok(total)
    }

    fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        let mut ids = Vec::new();
        for member in &self.members {
            ids.extend(member.blob_ids()?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn metrics(&self) -> BlobStoreMetrics {
        let mut total = BlobStoreMetrics::default();
        for member in &self.members {
            total.merge(&member.metrics());
        }
        total
    }

    fn recalculate_metrics(&self) -> StoreResult<BlobStoreMetrics> {
        let mut total = BlobStoreMetrics::default();
        for member in &self.members {
            total.merge(&member.recalculate_metrics()?);
        }
        Ok(total)
    }

    fn soft_delete_index(&self) -> Option<&SoftDeletedBlobIndex> {
        None
    }

    fn members(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    fn is_writable(&self) -> bool {
        self.members.iter().any(|m| m.is_writable())
    }

    fn remove(&self) -> StoreResult<()> {
        Ok(())
    }
}
