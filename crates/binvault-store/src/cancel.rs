//! Cooperative cancellation for maintenance runs.
//!
//! The admin layer keeps the [`CancelHandle`]; the [`CancelToken`] travels into
//! task runners and compaction loops, which poll it between units of work.
//! Work already in flight is never interrupted.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{StoreError, StoreResult};

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The operator interrupted the run (Ctrl-C).
    Interrupted,
    /// The process is shutting down.
    Shutdown,
    /// A newer run of the same task took over.
    Replaced,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelReason::Interrupted => "interrupted",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Replaced => "replaced",
        })
    }
}

/// Read side of a cancellation signal. Clones observe the same signal.
#[derive(Clone, Default)]
pub struct CancelToken {
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelToken {
    /// A token nobody can cancel.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The first reason given, if cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Fails with [`StoreError::Cancelled`] naming `context` once cancelled.
    pub fn check(&self, context: &str) -> StoreResult<()> {
        match self.reason() {
            Some(reason) => Err(StoreError::Cancelled(format!("{} ({})", context, reason))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken").field(&self.reason()).finish()
    }
}

/// Write side of a cancellation signal.
#[derive(Clone)]
pub struct CancelHandle {
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    /// Cancels the paired token. Later reasons are ignored.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
    }

    /// Whether [`CancelHandle::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }
}

/// Creates a linked token and handle.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let reason = Arc::new(OnceLock::new());
    (
        CancelToken {
            reason: reason.clone(),
        },
        CancelHandle { reason },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_pair_is_live() {
        let (token, handle) = new_cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!handle.is_cancelled());
        assert!(token.check("purge").is_ok());
    }

    #[test]
    fn test_clones_observe_cancel() {
        let (token, handle) = new_cancel_pair();
        let worker_copy = token.clone();
        handle.clone().cancel(CancelReason::Shutdown);
        assert!(token.is_cancelled());
        assert_eq!(worker_copy.reason(), Some(CancelReason::Shutdown));
    }

    #[test]
    fn test_first_reason_sticks() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Replaced);
        handle.cancel(CancelReason::Interrupted);
        assert_eq!(token.reason(), Some(CancelReason::Replaced));
    }

    #[test]
    fn test_check_names_context_and_reason() {
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::Interrupted);
        let err = token.check("compact 'main'").unwrap_err();
        assert!(matches!(err, StoreError::Cancelled(_)));
        let message = err.to_string();
        assert!(message.contains("compact 'main'"));
        assert!(message.contains("interrupted"));
        assert!(!CancelToken::none().is_cancelled());
    }
}
