//! Object storage client interface and an in-memory implementation.
//!
//! The trait mirrors the subset of the S3 API the object blob store needs.
//! Requests carry a header map so encryption directives can be attached
//! without the client knowing about them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Request headers, sorted for stable comparison.
pub type ObjectHeaders = BTreeMap<String, String>;

/// Single-part upload.
#[derive(Debug, Clone)]
pub struct PutObjectRequest {
    /// Target bucket.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Object body.
    pub body: Bytes,
    /// Request headers.
    pub headers: ObjectHeaders,
}

/// Server-side copy.
#[derive(Debug, Clone)]
pub struct CopyObjectRequest {
    /// Bucket holding both objects.
    pub bucket: String,
    /// Key to copy from.
    pub source_key: String,
    /// Key to copy to.
    pub destination_key: String,
    /// Request headers applied to the destination.
    pub headers: ObjectHeaders,
}

/// Multipart upload initiation.
#[derive(Debug, Clone)]
pub struct InitiateMultipartRequest {
    /// Target bucket.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Request headers.
    pub headers: ObjectHeaders,
}

/// An object as returned by a get.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object body.
    pub body: Bytes,
    /// Headers recorded when the object was written.
    pub headers: ObjectHeaders,
}

/// One page of a key listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    /// Keys in lexical order.
    pub keys: Vec<String>,
    /// Token for the next page, `None` on the last page.
    pub continuation: Option<String>,
}

/// Operations the object blob store uses.
pub trait ObjectStorageClient: Send + Sync {
    /// Whether the bucket exists.
    fn bucket_exists(&self, bucket: &str) -> StoreResult<bool>;
    /// Creates the bucket.
    fn create_bucket(&self, bucket: &str) -> StoreResult<()>;
    /// Uploads an object in one request.
    fn put_object(&self, request: PutObjectRequest) -> StoreResult<()>;
    /// Reads an object, `None` if absent.
    fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<StoredObject>>;
    /// Whether an object exists.
    fn head_object(&self, bucket: &str, key: &str) -> StoreResult<bool>;
    /// Deletes an object; returns whether it existed.
    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<bool>;
    /// Copies an object within a bucket.
    fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<()>;
    /// Lists keys under a prefix, one page at a time.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ObjectListing>;
    /// Starts a multipart upload and returns its id.
    fn initiate_multipart(&self, request: InitiateMultipartRequest) -> StoreResult<String>;
    /// Uploads one part.
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<()>;
    /// Assembles the parts into the final object.
    fn complete_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> StoreResult<()>;
    /// Discards an unfinished upload.
    fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> StoreResult<()>;
}

/// Request counters of the in-memory client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryClientStats {
    /// Single-part uploads.
    pub puts: u64,
    /// Reads.
    pub gets: u64,
    /// Deletes.
    pub deletes: u64,
    /// Copies.
    pub copies: u64,
    /// Multipart uploads started.
    pub multipart_initiated: u64,
    /// Multipart uploads completed.
    pub multipart_completed: u64,
    /// Multipart uploads aborted.
    pub multipart_aborted: u64,
}

struct Upload {
    bucket: String,
    key: String,
    headers: ObjectHeaders,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct ClientState {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    stats: InMemoryClientStats,
}

/// In-process object storage used by tests and local setups.
#[derive(Default)]
pub struct InMemoryObjectStorageClient {
    state: Mutex<ClientState>,
    failing_writes: AtomicUsize,
    failing_suffix: Mutex<Option<String>>,
}

impl InMemoryObjectStorageClient {
    /// Creates a client with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` write requests fail with a backend error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Makes puts, copies and part uploads to keys ending in `suffix` fail
    /// until [`InMemoryObjectStorageClient::clear_failures`] is called.
    pub fn fail_writes_to(&self, suffix: &str) {
        *self.failing_suffix.lock() = Some(suffix.to_string());
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.failing_writes.store(0, Ordering::SeqCst);
        *self.failing_suffix.lock() = None;
    }

    /// Request counters.
    pub fn stats(&self) -> InMemoryClientStats {
        self.state.lock().stats.clone()
    }

    /// Headers stored with an object.
    pub fn object_headers(&self, bucket: &str, key: &str) -> Option<ObjectHeaders> {
        let state = self.state.lock();
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.headers.clone())
    }

    /// Number of objects in a bucket.
    pub fn object_count(&self, bucket: &str) -> usize {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    /// Number of unfinished multipart uploads.
    pub fn pending_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    fn check_write(&self, what: &str, key: Option<&str>) -> StoreResult<()> {
        let suffix_hit = match (key, self.failing_suffix.lock().as_deref()) {
            (Some(key), Some(suffix)) => key.ends_with(suffix),
            _ => false,
        };
        let injected = suffix_hit
            || self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(StoreError::Backend {
                store: "in-memory".to_string(),
                reason: format!("injected failure on {}", what),
            });
        }
        Ok(())
    }
}

fn no_bucket(bucket: &str) -> StoreError {
    StoreError::Backend {
        store: "in-memory".to_string(),
        reason: format!("no such bucket '{}'", bucket),
    }
}

impl ObjectStorageClient for InMemoryObjectStorageClient {
    fn bucket_exists(&self, bucket: &str) -> StoreResult<bool> {
        Ok(self.state.lock().buckets.contains_key(bucket))
    }

    fn create_bucket(&self, bucket: &str) -> StoreResult<()> {
        self.state.lock().buckets.entry(bucket.to_string()).or_default();
        debug!("Created bucket {}", bucket);
        Ok(())
    }

    fn put_object(&self, request: PutObjectRequest) -> StoreResult<()> {
        self.check_write("put", Some(&request.key))?;
        let mut state = self.state.lock();
        state.stats.puts += 1;
        let objects = state
            .buckets
            .get_mut(&request.bucket)
            .ok_or_else(|| no_bucket(&request.bucket))?;
        objects.insert(
            request.key,
            StoredObject {
                body: request.body,
                headers: request.headers,
            },
        );
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> StoreResult<Option<StoredObject>> {
        let mut state = self.state.lock();
        state.stats.gets += 1;
        let objects = state.buckets.get(bucket).ok_or_else(|| no_bucket(bucket))?;
        Ok(objects.get(key).cloned())
    }

    fn head_object(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let state = self.state.lock();
        let objects = state.buckets.get(bucket).ok_or_else(|| no_bucket(bucket))?;
        Ok(objects.contains_key(key))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        self.check_write("delete", None)?;
        let mut state = self.state.lock();
        state.stats.deletes += 1;
        let objects = state.buckets.get_mut(bucket).ok_or_else(|| no_bucket(bucket))?;
        Ok(objects.remove(key).is_some())
    }

    fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<()> {
        self.check_write("copy", Some(&request.destination_key))?;
        let mut state = self.state.lock();
        state.stats.copies += 1;
        let objects = state
            .buckets
            .get_mut(&request.bucket)
            .ok_or_else(|| no_bucket(&request.bucket))?;
        let source = objects.get(&request.source_key).cloned().ok_or_else(|| {
            StoreError::Backend {
                store: "in-memory".to_string(),
                reason: format!("copy source '{}' not found", request.source_key),
            }
        })?;
        let mut headers = source.headers;
        headers.extend(request.headers);
        objects.insert(
            request.destination_key,
            StoredObject {
                body: source.body,
                headers,
            },
        );
        Ok(())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
        max_keys: usize,
    ) -> StoreResult<ObjectListing> {
        let state = self.state.lock();
        let objects = state.buckets.get(bucket).ok_or_else(|| no_bucket(bucket))?;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.map_or(true, |after| k.as_str() > after))
            .take(max_keys.max(1) + 1)
            .cloned()
            .collect();
        let continuation = if keys.len() > max_keys.max(1) {
            keys.pop();
            keys.last().cloned()
        } else {
            None
        };
        Ok(ObjectListing { keys, continuation })
    }

    fn initiate_multipart(&self, request: InitiateMultipartRequest) -> StoreResult<String> {
        self.check_write("initiate multipart", None)?;
        let mut state = self.state.lock();
        if !state.buckets.contains_key(&request.bucket) {
            return Err(no_bucket(&request.bucket));
        }
        state.next_upload += 1;
        state.stats.multipart_initiated += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: request.bucket,
                key: request.key,
                headers: request.headers,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<()> {
        self.check_write("upload part", Some(key))?;
        let mut state = self.state.lock();
        let upload = state.uploads.get_mut(upload_id).ok_or_else(|| StoreError::Backend {
            store: "in-memory".to_string(),
            reason: format!("unknown upload '{}'", upload_id),
        })?;
        upload.parts.insert(part_number, body);
        Ok(())
    }

    fn complete_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> StoreResult<()> {
        self.check_write("complete multipart", None)?;
        let mut state = self.state.lock();
        let upload = state.uploads.remove(upload_id).ok_or_else(|| StoreError::Backend {
            store: "in-memory".to_string(),
            reason: format!("unknown upload '{}'", upload_id),
        })?;
        let mut body = BytesMut::new();
        for part in upload.parts.values() {
            body.extend_from_slice(part);
        }
        state.stats.multipart_completed += 1;
        let objects = state
            .buckets
            .get_mut(&upload.bucket)
            .ok_or_else(|| no_bucket(&upload.bucket))?;
        objects.insert(
            upload.key,
            StoredObject {
                body: body.freeze(),
                headers: upload.headers,
            },
        );
        Ok(())
    }

    fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.uploads.remove(upload_id).is_some() {
            state.stats.multipart_aborted += 1;
        }
        Ok(())
    }
}
