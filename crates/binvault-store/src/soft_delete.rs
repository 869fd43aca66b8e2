//! Soft-deleted blob index.
//!
//! Logical deletes are recorded here and reclaimed later in batches. The
//! index is a per-store view over a [`SoftDeletedBlobDao`], which stands in
//! for the transactional data-access layer that persists the rows.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::BlobId;
use crate::error::{StoreError, StoreResult};

/// Default number of records pulled per page by the cursor.
pub const DEFAULT_BATCH_LIMIT: usize = 1000;
/// Default number of rows removed per transaction by bulk clears.
pub const DEFAULT_DELETE_BATCH: usize = 1000;

/// One pending-deletion entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDeletedBlobRecord {
    /// Owning store.
    pub store_name: String,
    /// The soft-deleted blob.
    pub blob_id: BlobId,
    /// Creation time reference used to locate the blob's date directory.
    pub date_path_ref: DateTime<Utc>,
    /// When the blob was soft-deleted.
    pub deleted_at: DateTime<Utc>,
}

/// A page of records plus the token to read the next one.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    /// Records in insertion order.
    pub records: Vec<SoftDeletedBlobRecord>,
    /// Token to pass to the next read, `None` when nothing was returned.
    pub continuation: Option<String>,
}

/// Persistence operations the index needs from the data-access layer.
///
/// Every method is expected to run in its own transaction.
pub trait SoftDeletedBlobDao: Send + Sync {
    /// Inserts a record; returns false if the blob is already pending.
    fn create(&self, record: SoftDeletedBlobRecord) -> StoreResult<bool>;
    /// Reads up to `limit` records after `continuation`.
    fn read_page(
        &self,
        store_name: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> StoreResult<RecordPage>;
    /// Removes one record; returns whether it existed.
    fn delete(&self, store_name: &str, blob_id: &BlobId) -> StoreResult<bool>;
    /// Removes up to `limit` records of a store; returns rows affected.
    fn delete_batch(&self, store_name: &str, limit: usize) -> StoreResult<usize>;
    /// Number of records for a store.
    fn count(&self, store_name: &str) -> StoreResult<u64>;
}

#[derive(Default)]
struct DaoState {
    next_row: u64,
    rows: HashMap<String, BTreeMap<u64, SoftDeletedBlobRecord>>,
    keys: HashMap<(String, BlobId), u64>,
}

/// In-process table with monotonically increasing row ids as tokens.
#[derive(Default)]
pub struct InMemorySoftDeletedBlobDao {
    state: Mutex<DaoState>,
}

impl InMemorySoftDeletedBlobDao {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SoftDeletedBlobDao for InMemorySoftDeletedBlobDao {
    fn create(&self, record: SoftDeletedBlobRecord) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let key = (record.store_name.clone(), record.blob_id.clone());
        if state.keys.contains_key(&key) {
            return Ok(false);
        }
        state.next_row += 1;
        let row = state.next_row;
        state.keys.insert(key, row);
        state
            .rows
            .entry(record.store_name.clone())
            .or_default()
            .insert(row, record);
        Ok(true)
    }

    fn read_page(
        &self,
        store_name: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> StoreResult<RecordPage> {
        let after = match continuation {
            Some(token) => token.parse::<u64>().map_err(|_| {
                StoreError::Configuration(format!("invalid continuation token '{}'", token))
            })?,
            None => 0,
        };
        let state = self.state.lock();
        let Some(rows) = state.rows.get(store_name) else {
            return Ok(RecordPage::default());
        };
        let page: Vec<(u64, SoftDeletedBlobRecord)> = rows
            .range(after + 1..)
            .take(limit)
            .map(|(row, rec)| (*row, rec.clone()))
            .collect();
        let continuation = page.last().map(|(row, _)| row.to_string());
        Ok(RecordPage {
            records: page.into_iter().map(|(_, rec)| rec).collect(),
            continuation,
        })
    }

    fn delete(&self, store_name: &str, blob_id: &BlobId) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let Some(row) = state.keys.remove(&(store_name.to_string(), blob_id.clone())) else {
            return Ok(false);
        };
        if let Some(rows) = state.rows.get_mut(store_name) {
            rows.remove(&row);
        }
        Ok(true)
    }

    fn delete_batch(&self, store_name: &str, limit: usize) -> StoreResult<usize> {
        let mut state = self.state.lock();
        let victims: Vec<(u64, BlobId)> = match state.rows.get(store_name) {
            Some(rows) => rows
                .iter()
                .take(limit)
                .map(|(row, rec)| (*row, rec.blob_id.clone()))
                .collect(),
            None => return Ok(0),
        };
        for (row, blob_id) in &victims {
            state.keys.remove(&(store_name.to_string(), blob_id.clone()));
            if let Some(rows) = state.rows.get_mut(store_name) {
                rows.remove(row);
            }
        }
        Ok(victims.len())
    }

    fn count(&self, store_name: &str) -> StoreResult<u64> {
        let state = self.state.lock();
        Ok(state.rows.get(store_name).map(|r| r.len() as u64).unwrap_or(0))
    }
}

/// Tuning for [`SoftDeletedBlobIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftDeleteIndexConfig {
    /// Records pulled per page by the cursor (default: 1000).
    pub batch_limit: usize,
    /// Rows removed per transaction by [`SoftDeletedBlobIndex::delete_all_records`] (default: 1000).
    pub delete_batch: usize,
}

impl Default for SoftDeleteIndexConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            delete_batch: DEFAULT_DELETE_BATCH,
        }
    }
}

#[derive(Default)]
struct Cursor {
    batch: VecDeque<BlobId>,
    continuation: Option<String>,
}

/// Pending-deletion set for exactly one store.
///
/// The paging cursor behind [`SoftDeletedBlobIndex::get_next_available_record`]
/// supports a single consumer; running two reclaimers against the same
/// store is unsupported.
pub struct SoftDeletedBlobIndex {
    dao: Arc<dyn SoftDeletedBlobDao>,
    config: SoftDeleteIndexConfig,
    store_name: OnceLock<String>,
    cursor: Mutex<Cursor>,
}

impl SoftDeletedBlobIndex {
    /// Creates an index that still needs [`SoftDeletedBlobIndex::init`].
    pub fn new(dao: Arc<dyn SoftDeletedBlobDao>, config: SoftDeleteIndexConfig) -> Self {
        Self {
            dao,
            config,
            store_name: OnceLock::new(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Binds the index to a store. May only be called once.
    pub fn init(&self, store_name: &str) -> StoreResult<()> {
        self.store_name.set(store_name.to_string()).map_err(|_| {
            StoreError::DoubleInit(format!(
                "soft-delete index already bound to store '{}', refusing '{}'",
                self.store_name.get().map(String::as_str).unwrap_or_default(),
                store_name
            ))
        })?;
        debug!("Soft-delete index initialized for store '{}'", store_name);
        Ok(())
    }

    fn store(&self) -> StoreResult<&str> {
        self.store_name
            .get()
            .map(String::as_str)
            .ok_or_else(|| StoreError::InvalidState {
                store: "<unbound>".to_string(),
                state: "soft-delete index used before init".to_string(),
            })
    }

    /// Marks a blob as pending deletion. Returns false if it already was.
    pub fn create_record(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let store = self.store()?;
        self.dao.create(SoftDeletedBlobRecord {
            store_name: store.to_string(),
            blob_id: blob_id.clone(),
            date_path_ref: blob_id.created_at(),
            deleted_at: Utc::now(),
        })
    }

    /// Removes a blob from the pending set (reclaimed or undeleted).
    pub fn delete_record(&self, blob_id: &BlobId) -> StoreResult<bool> {
        let store = self.store()?;
        self.dao.delete(store, blob_id)
    }

    /// Clears the store's pending set in fixed-size transactions.
    ///
    /// A failing batch aborts the clear; earlier batches stay committed.
    pub fn delete_all_records(&self) -> StoreResult<u64> {
        let store = self.store()?;
        let batch = self.config.delete_batch.max(1);
        let mut total = 0u64;
        loop {
            let affected = self.dao.delete_batch(store, batch)?;
            if affected == 0 {
                break;
            }
            total += affected as u64;
            debug!("Cleared {} soft-delete records from '{}'", affected, store);
        }
        *self.cursor.lock() = Cursor::default();
        info!("Cleared {} soft-delete records from store '{}'", total, store);
        Ok(total)
    }

    /// Number of pending records.
    pub fn size(&self) -> StoreResult<u64> {
        let store = self.store()?;
        self.dao.count(store)
    }

    /// Returns the next pending blob, paging through the table.
    ///
    /// Returns `None` once a fetch comes back empty; the following call
    /// starts a new pass from the beginning.
    pub fn get_next_available_record(&self) -> StoreResult<Option<BlobId>> {
        let store = self.store()?;
        let mut cursor = self.cursor.lock();
        if let Some(id) = cursor.batch.pop_front() {
            return Ok(Some(id));
        }

        let page = self.dao.read_page(
            store,
            cursor.continuation.as_deref(),
            self.config.batch_limit.max(1),
        )?;
        if page.records.is_empty() {
            cursor.continuation = None;
            return Ok(None);
        }
        debug!(
            "Fetched {} soft-delete records for '{}'",
            page.records.len(),
            store
        );
        cursor.continuation = page.continuation;
        cursor.batch = page.records.into_iter().map(|r| r.blob_id).collect();
        Ok(cursor.batch.pop_front())
    }

    /// Number of ids buffered by the cursor.
    pub fn buffered(&self) -> usize {
        self.cursor.lock().batch.len()
    }
}
