//! Cancellation token for long-running storage operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap cloneable cancellation flag.
///
/// Long operations that walk many sectors (preallocation, evacuation,
/// pruning batches) check the token between sectors and abandon the
/// remainder of their work once it is cancelled. The session layer ties a
/// token to the connection lifetime so a dropped connection stops its
/// in-flight storage work.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every clone of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// True once any clone has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
