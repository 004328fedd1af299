//! # Process-Wide Environment Guard
//!
//! The hugepage-backed DMA environment is process-wide state with
//! one-shot initialization semantics: the first engine in the process
//! pays for bring-up, later engines reuse it, and re-initialization is a
//! no-op rather than an error.

use lazy_static::lazy_static;
use spin::Once;

use crate::error::TransferError;

/// One-shot initialization guard.
///
/// The first `ensure` call runs the closure and records its outcome;
/// every later call returns the recorded outcome without running
/// anything.
pub struct OnceEnv {
    outcome: Once<Result<(), TransferError>>,
}

impl OnceEnv {
    /// Create an uninitialized guard
    pub const fn new() -> Self {
        Self {
            outcome: Once::new(),
        }
    }

    /// Run `init` exactly once; replay its outcome afterwards
    pub fn ensure<F>(&self, init: F) -> Result<(), TransferError>
    where
        F: FnOnce() -> Result<(), TransferError>,
    {
        *self.outcome.call_once(init)
    }

    /// Whether initialization has run (successfully or not)
    pub fn initialized(&self) -> bool {
        self.outcome.is_completed()
    }
}

impl Default for OnceEnv {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// Guard for the process-wide hugepage environment, shared by every
    /// engine instance in the process. Driver implementations route
    /// their environment bring-up through this.
    pub static ref HUGEPAGE_ENV: OnceEnv = OnceEnv::new();
}
