//! Error taxonomy for the apartment framework.
//!
//! Operation faults are opaque `anyhow::Error` values shared as [`Fault`] so a single
//! failure can be observed both from the `run` future that produced it and from the
//! aggregate raised at completion. Construction failures are the one category
//! surfaced synchronously — there is no apartment to aggregate into if construction
//! itself failed.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A single captured operation fault, shared between the aggregator and any `run`
/// future that wants to observe it immediately.
pub type Fault = Arc<anyhow::Error>;

/// Every fault captured by an apartment, in discovery order.
///
/// Carried by the completion signal and re-raised by graceful teardown. Cloneable so
/// any number of completion waiters observe the same failure.
#[derive(Debug, Clone)]
pub struct AggregateError {
    faults: Arc<[Fault]>,
}

impl AggregateError {
    pub(crate) fn new(faults: Vec<Fault>) -> Self {
        Self {
            faults: faults.into(),
        }
    }

    /// Captured faults in the order they were recorded.
    #[must_use]
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "apartment captured {} fault(s)", self.faults.len())?;
        for fault in self.faults.iter() {
            write!(f, "; {fault}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Failure of a single `run` submission.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// The body failed or panicked. The same fault is recorded into the apartment's
    /// aggregator, so it also surfaces at completion unless cleared.
    #[error("operation faulted: {0}")]
    Fault(Fault),
    /// The operation was cancelled. Cancellation is expected, not a defect, and is
    /// never recorded into the aggregator.
    #[error("operation cancelled")]
    Cancelled,
    /// The execution context went away before the operation ran.
    #[error("operation abandoned before it ran")]
    Abandoned,
}

impl RunError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Construction failed before an execution context existed.
///
/// Surfaced synchronously to the constructor's caller; never aggregated.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The dedicated thread could not be spawned.
    #[error("failed to spawn apartment thread")]
    Spawn(#[source] std::io::Error),
    /// The dedicated thread failed to build its runtime.
    #[error("failed to build apartment runtime")]
    Runtime(#[source] std::io::Error),
    /// The dedicated thread exited before signalling readiness.
    #[error("apartment thread exited before signalling readiness")]
    Handshake,
    /// No ambient tokio runtime was available for a pooled apartment.
    #[error("no ambient tokio runtime available")]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),
}

/// The background-operation count went negative — a release without a matching
/// start.
///
/// Recorded into the apartment's fault list instead of being thrown synchronously,
/// so the shutdown protocol stays deterministic even under a tracking bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("background operation count went negative ({count})")]
pub struct TrackerInvariantError {
    /// The count observed after the offending decrement.
    pub count: i64,
}
