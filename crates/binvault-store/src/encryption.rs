//! Server-side encryption directives for object storage requests.
//!
//! Encryption is applied by the provider; the store only decorates outbound
//! put, copy and multipart-initiate requests with the matching headers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::BlobStoreConfiguration;

/// Header selecting the server-side encryption algorithm.
pub const HEADER_SSE: &str = "x-amz-server-side-encryption";
/// Header pinning the KMS key used for `aws:kms`.
pub const HEADER_SSE_KMS_KEY_ID: &str = "x-amz-server-side-encryption-aws-kms-key-id";

/// Attribute selecting the encryption strategy.
pub const ENCRYPTION_TYPE_ATTR: &str = "encryption_type";
/// Attribute holding the optional KMS key id.
pub const ENCRYPTION_KEY_ATTR: &str = "encryption_key";

/// Algorithm value for provider-managed keys.
pub const SSE_AES256: &str = "AES256";
/// Algorithm value for KMS-managed keys.
pub const SSE_KMS: &str = "aws:kms";

/// How objects written by a store are encrypted at rest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionStrategy {
    /// No encryption header is sent.
    #[default]
    None,
    /// Provider-managed keys (`AES256`).
    ProviderManaged,
    /// KMS-managed keys, optionally pinned to one key id.
    KmsManaged {
        /// Key id; `None` lets the provider pick its default key.
        key_id: Option<String>,
    },
}

impl EncryptionStrategy {
    /// KMS strategy; a blank key id is treated as absent.
    pub fn kms(key_id: Option<&str>) -> Self {
        let key_id = key_id
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        EncryptionStrategy::KmsManaged { key_id }
    }

    /// Selects the strategy from a store's attributes.
    pub fn from_config(config: &BlobStoreConfiguration) -> StoreResult<Self> {
        let kind = config
            .attribute(ENCRYPTION_TYPE_ATTR)
            .map(str::trim)
            .unwrap_or("none");
        let strategy = match kind {
            "" | "none" => EncryptionStrategy::None,
            "s3ManagedEncryption" => EncryptionStrategy::ProviderManaged,
            "kmsManagedEncryption" => Self::kms(config.attribute(ENCRYPTION_KEY_ATTR)),
            other => {
                return Err(StoreError::Configuration(format!(
                    "store '{}' has unknown encryption type '{}'",
                    config.name, other
                )))
            }
        };
        debug!("Store '{}' uses encryption {:?}", config.name, strategy);
        Ok(strategy)
    }

    fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            EncryptionStrategy::None => {}
            EncryptionStrategy::ProviderManaged => {
                headers.insert(HEADER_SSE.to_string(), SSE_AES256.to_string());
            }
            EncryptionStrategy::KmsManaged { key_id } => {
                headers.insert(HEADER_SSE.to_string(), SSE_KMS.to_string());
                if let Some(key_id) = key_id {
                    headers.insert(HEADER_SSE_KMS_KEY_ID.to_string(), key_id.clone());
                }
            }
        }
    }

    /// Decorates a single-part upload.
    pub fn decorate_put(&self, headers: &mut BTreeMap<String, String>) {
        self.apply(headers);
    }

    /// Decorates a server-side copy.
    pub fn decorate_copy(&self, headers: &mut BTreeMap<String, String>) {
        self.apply(headers);
    }

    /// Decorates a multipart upload initiation.
    pub fn decorate_multipart_init(&self, headers: &mut BTreeMap<String, String>) {
        self.apply(headers);
    }
}
