//! Counted tracking of fire-and-forget background operations.

use crate::error::TrackerInvariantError;

/// Counted semaphore-like tracker: increment on operation start, decrement on
/// completion.
///
/// The drained notification and the tri-state outstanding report live at the
/// apartment layer, which knows its variant's tracking mode and the
/// completion-commenced flag; locking is likewise the owner's single mutex.
#[derive(Debug, Default)]
pub struct BackgroundTracker {
    count: i64,
}

impl BackgroundTracker {
    #[must_use]
    pub fn new() -> Self {
        Self { count: 0 }
    }

    /// Record one operation start.
    pub fn started(&mut self) {
        self.count += 1;
    }

    /// Record one operation completion.
    ///
    /// A negative result is a release without a matching start. The error is meant
    /// to be recorded as a fault rather than thrown, to avoid re-entrancy hazards in
    /// completion paths.
    pub fn completed(&mut self) -> Result<(), TrackerInvariantError> {
        self.count -= 1;
        if self.count < 0 {
            return Err(TrackerInvariantError { count: self.count });
        }
        Ok(())
    }

    /// Whether any tracked operation is still outstanding.
    #[must_use]
    pub fn outstanding(&self) -> bool {
        self.count > 0
    }

    #[must_use]
    pub fn count(&self) -> i64 {
        self.count
    }
}
