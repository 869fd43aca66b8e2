//! Maintenance freeze.
//!
//! While frozen, mutating operations fail fast with [`StoreError::Frozen`];
//! reads stay available.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Gate consulted before store operations.
pub trait FreezeService: Send + Sync {
    /// Fails with [`StoreError::Frozen`] while the system is frozen.
    fn check_writable(&self, operation: &str) -> StoreResult<()>;

    /// Fails if reads are not allowed. Reads are allowed during a freeze.
    fn check_readable(&self, _operation: &str) -> StoreResult<()> {
        Ok(())
    }

    /// Whether a freeze is in effect.
    fn is_frozen(&self) -> bool;
}

/// Process-local freeze toggled by the admin layer.
#[derive(Debug, Default)]
pub struct LocalFreezeService {
    frozen: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LocalFreezeService {
    /// Creates an unfrozen service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the freeze.
    pub fn freeze(&self, reason: &str) {
        *self.reason.lock() = Some(reason.to_string());
        self.frozen.store(true, Ordering::SeqCst);
        info!("System frozen: {}", reason);
    }

    /// Leaves the freeze.
    pub fn release(&self) {
        if self.frozen.swap(false, Ordering::SeqCst) {
            *self.reason.lock() = None;
            info!("System freeze released");
        }
    }

    /// Why the system is frozen, if it is.
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl FreezeService for LocalFreezeService {
    fn check_writable(&self, operation: &str) -> StoreResult<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(StoreError::Frozen {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }
}
