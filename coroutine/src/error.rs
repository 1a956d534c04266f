//! Coroutine rendezvous failures.

use std::sync::Arc;

use thiserror::Error;

/// Failure of a coroutine rendezvous operation.
///
/// Cloneable: a terminal fault travels both through the channel (to release a
/// blocked consumer) and back to the driver's caller.
#[derive(Debug, Clone, Error)]
pub enum CoroutineError {
    /// `drive` was called on a proxy that already published its sequence. The
    /// first subscriber is unaffected.
    #[error("coroutine sequence already published")]
    AlreadyPublished,
    /// `subscribe` was called on a proxy whose sequence was already claimed.
    #[error("coroutine sequence already claimed")]
    AlreadySubscribed,
    /// The proxy went away without ever publishing a sequence.
    #[error("coroutine sequence was never published")]
    Unpublished,
    /// The rendezvous was cancelled; pending waits resolve instead of hanging.
    #[error("coroutine rendezvous cancelled")]
    Cancelled,
    /// The producer sequence failed. The fault is carried to the consumer and
    /// re-raised to the driver's caller.
    #[error("coroutine producer faulted: {0}")]
    Faulted(Arc<anyhow::Error>),
}

impl CoroutineError {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
