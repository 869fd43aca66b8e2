//! Date-partitioned content layout shared by the file and object backends.
//!
//! Blobs live at `content/<yyyyMMddHH>/<blobId>.bytes` with a sibling
//! `.properties` record; the hour directory is always 10 zero-padded digits
//! in UTC.

use chrono::{DateTime, Utc};

use crate::blob::BlobId;

/// Top-level directory (or key prefix) holding blob content.
pub const CONTENT_DIR: &str = "content";
/// Directory for in-flight writes on the file backend.
pub const TEMP_DIR: &str = "tmp";
/// Extension of payload files.
pub const BYTES_EXTENSION: &str = "bytes";
/// Extension of record files.
pub const PROPERTIES_EXTENSION: &str = "properties";
/// Width of the hour directory name.
pub const DATE_DIR_LEN: usize = 10;

/// Hour directory name for a timestamp.
pub fn date_dir(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H").to_string()
}

/// Relative directory holding a blob's files.
pub fn blob_dir(blob_id: &BlobId) -> String {
    format!("{}/{}", CONTENT_DIR, date_dir(&blob_id.created_at()))
}

/// Relative path of a blob's payload.
pub fn bytes_path(blob_id: &BlobId) -> String {
    format!("{}/{}.{}", blob_dir(blob_id), blob_id, BYTES_EXTENSION)
}

/// Relative path of a blob's record.
pub fn properties_path(blob_id: &BlobId) -> String {
    format!("{}/{}.{}", blob_dir(blob_id), blob_id, PROPERTIES_EXTENSION)
}

/// Whether a directory name is a well-formed hour directory.
pub fn is_date_dir(name: &str) -> bool {
    name.len() == DATE_DIR_LEN && name.bytes().all(|b| b.is_ascii_digit())
}
