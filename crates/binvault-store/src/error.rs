//! Error types for the blob store subsystem.

use thiserror::Error;

use crate::blob::BlobId;

/// Result type alias for blob store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for blob store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors from the filesystem backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient failure reported by a backend that is not a local I/O error.
    #[error("Backend error in store '{store}': {reason}")]
    Backend {
        /// Name of the store that failed.
        store: String,
        /// Description of the failure.
        reason: String,
    },

    /// The requested blob does not exist.
    #[error("Blob not found: {blob_id}")]
    BlobNotFound {
        /// The blob ID that was not found.
        blob_id: BlobId,
    },

    /// The requested blob store is not registered.
    #[error("Blob store not found: {name}")]
    StoreNotFound {
        /// Name of the missing store.
        name: String,
    },

    /// Stored content does not match its recorded hash.
    #[error("Integrity failure on blob {blob_id}: expected sha256 {expected}, actual {actual}")]
    Integrity {
        /// The corrupted blob.
        blob_id: BlobId,
        /// Hash recorded when the blob was written.
        expected: String,
        /// Hash of the bytes currently stored.
        actual: String,
    },

    /// Invalid configuration, rejected before any state was mutated.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A write would exceed the store quota.
    #[error("Quota exceeded on store '{store}': {reason}")]
    QuotaExceeded {
        /// Store whose quota would be violated.
        store: String,
        /// Description of the violated limit.
        reason: String,
    },

    /// The system is in a maintenance freeze.
    #[error("System is frozen, rejecting {operation}; retry once the freeze is released")]
    Frozen {
        /// The rejected operation.
        operation: String,
    },

    /// A maintenance task was cancelled.
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    /// A one-shot initializer was called twice.
    #[error("Already initialized: {0}")]
    DoubleInit(String),

    /// Record serialization/deserialization failed.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("Invalid state for store '{store}': {state}")]
    InvalidState {
        /// The store name.
        store: String,
        /// The state it was in.
        state: String,
    },
}

impl StoreError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Backend { .. } | StoreError::Frozen { .. }
        )
    }

    /// Whether the error signals corruption or a programming fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Integrity { .. } | StoreError::DoubleInit(_))
    }

    /// Whether the error means the target blob or store is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::BlobNotFound { .. } | StoreError::StoreNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_result_alias() {
        let ok: StoreResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StoreResult<i32> = Err(StoreError::Configuration("bad".into()));
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = std_err.into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_blob_not_found_message() {
        let id = BlobId::parse("abc@202401020304").unwrap();
        let err = StoreError::BlobNotFound { blob_id: id };
        assert_eq!(format!("{}", err), "Blob not found: abc@202401020304");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_integrity_is_fatal() {
        let err = StoreError::Integrity {
            blob_id: BlobId::parse("abc@202401020304").unwrap(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        let msg = format!("{}", err);
        assert!(msg.contains("aa"));
        assert!(msg.contains("bb"));
    }

    #[test]
    fn test_frozen_is_retryable() {
        let err = StoreError::Frozen {
            operation: "create".into(),
        };
        assert!(err.is_retryable());
        assert!(format!("{}", err).contains("create"));
    }

    #[test]
    fn test_double_init_is_fatal() {
        assert!(StoreError::DoubleInit("index".into()).is_fatal());
    }

    #[test]
    fn test_serde_json_error_converts() {
        let e = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: StoreError = e.into();
        assert!(matches!(err, StoreError::Serialization { .. }));
    }
}
