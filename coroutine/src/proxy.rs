//! The proxy state machine: unpublished → published → closed.
//!
//! The channel closes exactly once — normally by dropping the sender, abnormally by
//! sending a terminal error first — so the consumer can always distinguish
//! end-of-sequence from a carried fault or cancellation.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::future::{AbortRegistration, Abortable, Aborted};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::CoroutineError;

type Item<T> = Result<T, CoroutineError>;
type Sequence<T> = mpsc::UnboundedReceiver<Item<T>>;

/// Rendezvous channel pairing a driven producer sequence with a single awaiting
/// subscriber.
pub struct CoroutineProxy<T> {
    publish: Mutex<Option<oneshot::Sender<Sequence<T>>>>,
    claim: Mutex<Option<oneshot::Receiver<Sequence<T>>>>,
}

impl<T> CoroutineProxy<T> {
    #[must_use]
    pub fn new() -> Self {
        let (publish, claim) = oneshot::channel();
        Self {
            publish: Mutex::new(Some(publish)),
            claim: Mutex::new(Some(claim)),
        }
    }

    /// Publish the consumable sequence, then forward `source` into it in order.
    ///
    /// Normal exhaustion closes the sequence with no fault. A source fault closes
    /// the sequence carrying that fault and is re-raised here. A second `drive`
    /// fails with [`CoroutineError::AlreadyPublished`] and leaves the first
    /// subscriber untouched.
    pub async fn drive<S>(&self, source: S) -> Result<(), CoroutineError>
    where
        S: Stream<Item = Result<T, anyhow::Error>>,
    {
        let sender = self.publish_sequence()?;
        Self::forward(source, &sender).await
    }

    /// [`drive`](Self::drive) with a cancellation signal: aborting closes the
    /// sequence with [`CoroutineError::Cancelled`], so a blocked consumer resolves
    /// instead of hanging.
    pub async fn drive_abortable<S>(
        &self,
        source: S,
        registration: AbortRegistration,
    ) -> Result<(), CoroutineError>
    where
        S: Stream<Item = Result<T, anyhow::Error>>,
    {
        let sender = self.publish_sequence()?;
        match Abortable::new(Self::forward(source, &sender), registration).await {
            Ok(outcome) => outcome,
            Err(Aborted) => {
                let _ = sender.send(Err(CoroutineError::Cancelled));
                Err(CoroutineError::Cancelled)
            }
        }
    }

    /// Claim the consumable sequence, suspending until it is published.
    pub async fn subscribe(&self) -> Result<CoroutineConsumer<T>, CoroutineError> {
        let handshake = self.claim_handshake()?;
        match handshake.await {
            Ok(sequence) => Ok(CoroutineConsumer { sequence }),
            Err(_) => Err(CoroutineError::Unpublished),
        }
    }

    /// [`subscribe`](Self::subscribe) with a cancellation signal.
    pub async fn subscribe_abortable(
        &self,
        registration: AbortRegistration,
    ) -> Result<CoroutineConsumer<T>, CoroutineError> {
        let handshake = self.claim_handshake()?;
        match Abortable::new(handshake, registration).await {
            Ok(Ok(sequence)) => Ok(CoroutineConsumer { sequence }),
            Ok(Err(_)) => Err(CoroutineError::Unpublished),
            Err(Aborted) => Err(CoroutineError::Cancelled),
        }
    }

    fn publish_sequence(&self) -> Result<mpsc::UnboundedSender<Item<T>>, CoroutineError> {
        let handshake = self
            .publish
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(CoroutineError::AlreadyPublished)?;
        let (sender, sequence) = mpsc::unbounded_channel();
        // A subscriber that already gave up is not an error; values go nowhere.
        let _ = handshake.send(sequence);
        debug!("coroutine sequence published");
        Ok(sender)
    }

    fn claim_handshake(&self) -> Result<oneshot::Receiver<Sequence<T>>, CoroutineError> {
        self.claim
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(CoroutineError::AlreadySubscribed)
    }

    async fn forward<S>(
        source: S,
        sender: &mpsc::UnboundedSender<Item<T>>,
    ) -> Result<(), CoroutineError>
    where
        S: Stream<Item = Result<T, anyhow::Error>>,
    {
        futures_util::pin_mut!(source);
        while let Some(item) = source.next().await {
            match item {
                Ok(value) => {
                    if sender.send(Ok(value)).is_err() {
                        // The consumer went away mid-sequence; stop driving.
                        debug!("coroutine consumer gone; stopping drive");
                        break;
                    }
                }
                Err(err) => {
                    let fault = Arc::new(err);
                    let _ = sender.send(Err(CoroutineError::Faulted(Arc::clone(&fault))));
                    return Err(CoroutineError::Faulted(fault));
                }
            }
        }
        Ok(())
    }
}

impl<T> Default for CoroutineProxy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CoroutineProxy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineProxy").finish_non_exhaustive()
    }
}

/// The single consumer of a proxy's sequence.
pub struct CoroutineConsumer<T> {
    sequence: Sequence<T>,
}

impl<T> CoroutineConsumer<T> {
    /// Pull the next value, suspending the caller until one is available.
    ///
    /// Resolves `Ok(None)` at normal end-of-sequence; a carried fault or
    /// cancellation propagates as the error.
    pub async fn next(&mut self) -> Result<Option<T>, CoroutineError> {
        match self.sequence.recv().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// [`next`](Self::next) with a cancellation signal.
    pub async fn next_abortable(
        &mut self,
        registration: AbortRegistration,
    ) -> Result<Option<T>, CoroutineError> {
        match Abortable::new(self.sequence.recv(), registration).await {
            Ok(Some(Ok(value))) => Ok(Some(value)),
            Ok(Some(Err(err))) => Err(err),
            Ok(None) => Ok(None),
            Err(Aborted) => Err(CoroutineError::Cancelled),
        }
    }
}

impl<T> Stream for CoroutineConsumer<T> {
    type Item = Result<T, CoroutineError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().sequence.poll_recv(cx)
    }
}

impl<T> fmt::Debug for CoroutineConsumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineConsumer").finish_non_exhaustive()
    }
}
