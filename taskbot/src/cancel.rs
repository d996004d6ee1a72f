//! Cancellation tokens shared between the control thread and job threads
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Token to cancel an in-progress operation
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Build a new token, which is initialize as "not cancelled"
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this token as cancelled
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Check if the token is cancelled
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(Error::Aborted)` if the token is cancelled
    ///
    /// This is a convenience for geometry engines, which are expected to poll
    /// the token inside their inner loops.
    pub fn check(&self) -> Result<(), crate::Error> {
        if self.is_cancelled() {
            Err(crate::Error::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Pair of cancellation tokens owned by a single job
///
/// - `soft` is polled by the job itself at coarse checkpoints (between shapes,
///   between octants)
/// - `hard` is passed into every native evaluation call, so that a long
///   computation can bail out without waiting for the next checkpoint
#[derive(Clone, Debug, Default)]
pub struct JobCancel {
    /// Coarse-grained flag, polled between units of work
    pub soft: CancelToken,
    /// Fine-grained flag, threaded into the geometry engine
    pub hard: CancelToken,
}

impl JobCancel {
    /// Builds a new pair of un-cancelled tokens
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both flags
    pub fn cancel(&self) {
        self.soft.cancel();
        self.hard.cancel();
    }

    /// Checks whether either flag is set
    pub fn is_cancelled(&self) -> bool {
        self.soft.is_cancelled() || self.hard.is_cancelled()
    }

    /// Checkpoint used between coarse units of work
    pub fn checkpoint(&self) -> Result<(), crate::Error> {
        self.soft.check()
    }
}
