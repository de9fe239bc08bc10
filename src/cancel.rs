//! Cooperative cancellation for long-running operations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MinefieldError, Result};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that is never cancelled by anyone else
    pub fn none() -> Self {
        Self::default()
    }

    /// Wrap an existing flag (e.g. one registered with a signal handler)
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Err(Cancelled) once the token fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MinefieldError::Cancelled)
        } else {
            Ok(())
        }
    }
}
