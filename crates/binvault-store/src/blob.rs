//! Blob identity and metadata records.
//!
//! A [`BlobId`] carries the minute it was created, which is what places the
//! blob in the date-partitioned layout. A [`BlobRecord`] is the full metadata
//! for one blob and is always replaced as a whole, never patched in place.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Header holding the logical name of the blob (e.g. the artifact path).
pub const BLOB_NAME_HEADER: &str = "BlobStore.blob-name";
/// Header holding the principal that created the blob.
pub const CREATED_BY_HEADER: &str = "BlobStore.created-by";
/// Header holding the client address that created the blob.
pub const CREATED_BY_IP_HEADER: &str = "BlobStore.created-by-ip";
/// Header holding the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "BlobStore.content-type";

/// Headers supplied on create; sorted so record files are stable.
pub type BlobHeaders = BTreeMap<String, String>;

const ID_TIME_SEPARATOR: char = '@';

/// Opaque blob identifier with an embedded creation minute.
///
/// The string form is `<uuid>@<yyyyMMddHHmm>` in UTC. The creation time is
/// derived from the string, so equality is effectively by string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId {
    value: String,
    created: DateTime<Utc>,
}

impl BlobId {
    /// Creates a fresh id stamped with the given creation time.
    pub fn new(created: DateTime<Utc>) -> Self {
        let stamp = created.format("%Y%m%d%H%M").to_string();
        let created = parse_compact_timestamp(&stamp).unwrap_or(created);
        Self {
            value: format!("{}{}{}", Uuid::new_v4(), ID_TIME_SEPARATOR, stamp),
            created,
        }
    }

    /// Creates a fresh id stamped with the current time.
    pub fn generate() -> Self {
        Self::new(Utc::now())
    }

    /// Parses an id from its string form.
    pub fn parse(value: &str) -> StoreResult<Self> {
        let invalid = |why: &str| {
            StoreError::Configuration(format!("invalid blob id '{}': {}", value, why))
        };
        if value.contains(['/', '\\', '.']) || value.chars().any(char::is_whitespace) {
            return Err(invalid("contains path or whitespace characters"));
        }
        let (unique, suffix) = value
            .rsplit_once(ID_TIME_SEPARATOR)
            .ok_or_else(|| invalid("missing creation suffix"))?;
        if unique.is_empty() {
            return Err(invalid("empty unique part"));
        }
        if suffix.len() != 12 {
            return Err(invalid("creation suffix must be yyyyMMddHHmm"));
        }
        let created = parse_compact_timestamp(suffix).ok_or_else(|| invalid("bad creation suffix"))?;
        Ok(Self {
            value: value.to_string(),
            created,
        })
    }

    /// The creation minute embedded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created
    }

    /// Returns the string form.
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.value)
    }
}

impl TryFrom<String> for BlobId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BlobId::parse(&value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.value
    }
}

/// Parses fixed-width `yyyyMMddHH` or `yyyyMMddHHmm` digits as UTC.
pub fn parse_compact_timestamp(digits: &str) -> Option<DateTime<Utc>> {
    if !(digits.len() == 10 || digits.len() == 12) || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let field = |range: std::ops::Range<usize>| digits[range].parse::<u32>().ok();
    let year = digits[0..4].parse::<i32>().ok()?;
    let minute = if digits.len() == 12 { field(10..12)? } else { 0 };
    Utc.with_ymd_and_hms(year, field(4..6)?, field(6..8)?, field(8..10)?, minute, 0)
        .single()
}

/// Hex-encoded SHA-256 of a payload.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Metadata for one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// Identity of the blob.
    pub blob_id: BlobId,
    /// Payload size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the payload.
    pub sha256: String,
    /// When the blob was written.
    pub created_at: DateTime<Utc>,
    /// Caller-supplied headers.
    pub headers: BlobHeaders,
    /// Whether the blob has been soft-deleted.
    pub deleted: bool,
    /// Why it was soft-deleted.
    pub deleted_reason: Option<String>,
    /// When it was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Backend-specific physical location of the payload.
    pub location: String,
}

const SIZE_KEY: &str = "size";
const SHA256_KEY: &str = "sha256";
const CREATED_KEY: &str = "creationTime";
const DELETED_KEY: &str = "deleted";
const DELETED_REASON_KEY: &str = "deletedReason";
const DELETED_AT_KEY: &str = "deletedDateTime";
const HEADER_PREFIX: char = '@';

impl BlobRecord {
    /// Returns a copy marked as soft-deleted.
    pub fn mark_deleted(&self, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            deleted: true,
            deleted_reason: Some(reason.to_string()),
            deleted_at: Some(at),
            ..self.clone()
        }
    }

    /// Returns a copy with the soft-delete markers cleared.
    pub fn mark_undeleted(&self) -> Self {
        Self {
            deleted: false,
            deleted_reason: None,
            deleted_at: None,
            ..self.clone()
        }
    }

    /// Returns the named header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Renders the record as a `key=value` properties document.
    pub fn to_properties(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        };
        for (name, value) in &self.headers {
            push(&format!("{}{}", HEADER_PREFIX, name), value);
        }
        push(SIZE_KEY, &self.size.to_string());
        push(SHA256_KEY, &self.sha256);
        push(CREATED_KEY, &self.created_at.to_rfc3339());
        if self.deleted {
            push(DELETED_KEY, "true");
            if let Some(reason) = &self.deleted_reason {
                push(DELETED_REASON_KEY, reason);
            }
            if let Some(at) = &self.deleted_at {
                push(DELETED_AT_KEY, &at.to_rfc3339());
            }
        }
        out
    }

    /// Parses a properties document written by [`BlobRecord::to_properties`].
    pub fn from_properties(blob_id: BlobId, location: &str, text: &str) -> StoreResult<Self> {
        let mut headers = BlobHeaders::new();
        let mut values: BTreeMap<String, String> = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = split_key_value(line) else {
                return Err(serialization(&blob_id, &format!("malformed line '{}'", line)));
            };
            let key = unescape(key);
            let value = unescape(value);
            match key.strip_prefix(HEADER_PREFIX) {
                Some(name) => {
                    headers.insert(name.to_string(), value);
                }
                None => {
                    values.insert(key, value);
                }
            }
        }

        let required = |key: &str| {
            values
                .get(key)
                .cloned()
                .ok_or_else(|| serialization(&blob_id, &format!("missing '{}'", key)))
        };
        let parse_time = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| serialization(&blob_id, &format!("bad timestamp '{}': {}", raw, e)))
        };

        let size = required(SIZE_KEY)?
            .parse::<u64>()
            .map_err(|e| serialization(&blob_id, &format!("bad size: {}", e)))?;
        let sha256 = required(SHA256_KEY)?;
        let created_at = parse_time(&required(CREATED_KEY)?)?;
        let deleted = values.get(DELETED_KEY).map(|v| v == "true").unwrap_or(false);
        let deleted_at = match values.get(DELETED_AT_KEY) {
            Some(raw) => Some(parse_time(raw)?),
            None => None,
        };

        Ok(Self {
            blob_id,
            size,
            sha256,
            created_at,
            headers,
            deleted,
            deleted_reason: values.get(DELETED_REASON_KEY).cloned(),
            deleted_at,
            location: location.to_string(),
        })
    }
}

fn serialization(blob_id: &BlobId, reason: &str) -> StoreError {
    StoreError::Serialization {
        reason: format!("record for {}: {}", blob_id, reason),
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
    out
}

/// Splits at the first `=` not escaped by a backslash.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' => return Some((&line[..i], &line[i + 1..])),
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// A blob payload together with its record.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Metadata for the blob.
    pub record: BlobRecord,
    /// Payload bytes.
    pub content: Bytes,
}

impl Blob {
    /// The blob's identity.
    pub fn id(&self) -> &BlobId {
        &self.record.blob_id
    }

    /// Checks the payload against the recorded hash.
    pub fn verify(&self) -> StoreResult<()> {
        let actual = sha256_hex(&self.content);
        if actual != self.record.sha256 {
            return Err(StoreError::Integrity {
                blob_id: self.record.blob_id.clone(),
                expected: self.record.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Checks that the headers every blob must carry are present.
pub fn validate_headers(headers: &BlobHeaders) -> StoreResult<()> {
    for required in [BLOB_NAME_HEADER, CREATED_BY_HEADER] {
        if !headers.contains_key(required) {
            return Err(StoreError::Configuration(format!(
                "missing required header '{}'",
                required
            )));
        }
    }
    Ok(())
}
