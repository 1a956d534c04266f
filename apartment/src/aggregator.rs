//! Append-only fault collection.

use crate::error::Fault;

/// Accumulates faults from any number of concurrent operations.
///
/// A plain structure: the owning apartment serializes access under its single state
/// mutex, which also covers the background counter and the completion flag, so a
/// decrement-to-zero can never race a concurrent `complete`. No operation blocks.
#[derive(Debug, Default)]
pub struct FaultAggregator {
    faults: Vec<Fault>,
}

impl FaultAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self { faults: Vec::new() }
    }

    /// Append a fault. Never discards, never deduplicates.
    pub fn push(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Immutable copy of every fault collected so far, in discovery order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Fault> {
        self.faults.clone()
    }

    /// Drop every collected fault.
    ///
    /// Called by the owner after it has observed and handled the faults; never
    /// invoked automatically on read, so an unhandled set survives to the next
    /// teardown attempt.
    pub fn clear(&mut self) {
        self.faults.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.len()
    }
}
