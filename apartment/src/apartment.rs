//! The apartment contract: explicit context handles, tracked scopes, run futures.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::AbortRegistration;
use tokio::sync::oneshot;

use crate::core::ApartmentCore;
use crate::error::{AggregateError, Fault, RunError};

/// Observer invoked for every captured fault, in capture order.
///
/// The hook runs outside the apartment's state lock, on whichever task recorded the
/// fault.
pub type FaultHook = Arc<dyn Fn(&Fault) + Send + Sync>;

/// One tracked unit of background work: counted at creation, released on drop on
/// every exit path — including panic unwinds and dropped futures.
#[must_use = "a scope tracks background work only while it is held"]
pub struct AsyncScope {
    core: Arc<ApartmentCore>,
}

impl AsyncScope {
    pub(crate) fn new(core: Arc<ApartmentCore>) -> Self {
        core.operation_started();
        Self { core }
    }
}

impl Drop for AsyncScope {
    fn drop(&mut self) {
        self.core.operation_completed();
    }
}

impl fmt::Debug for AsyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncScope").finish_non_exhaustive()
    }
}

/// Future returned by `run`: resolves with the body's value, its fault (also
/// recorded into the apartment), cancellation, or abandonment.
///
/// Dropping the handle never cancels the submitted work; it only forgoes the
/// immediate view of its outcome.
pub struct RunHandle<T> {
    rx: oneshot::Receiver<Result<T, RunError>>,
}

impl<T> RunHandle<T> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<T, RunError>>) -> Self {
        Self { rx }
    }
}

impl<T> Future for RunHandle<T> {
    type Output = Result<T, RunError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The wrapper never ran: its execution context went away first.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RunError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for RunHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle").finish_non_exhaustive()
    }
}

/// Clonable handle to a live apartment.
///
/// Every body receives one explicitly instead of discovering its context through
/// ambient thread-local state, so nested submissions always reach the right
/// scheduler.
#[derive(Clone)]
pub struct ApartmentHandle {
    core: Arc<ApartmentCore>,
}

impl ApartmentHandle {
    pub(crate) fn new(core: Arc<ApartmentCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<ApartmentCore> {
        &self.core
    }
}

impl fmt::Debug for ApartmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApartmentHandle").finish_non_exhaustive()
    }
}

impl Apartment for ApartmentHandle {
    fn handle(&self) -> &ApartmentHandle {
        self
    }
}

/// The apartment contract: an execution context paired with fault aggregation and
/// background-operation tracking.
///
/// Work submitted through any method here executes on the apartment's own context,
/// never the submitter's.
pub trait Apartment {
    /// Handle to this apartment's shared state and scheduler.
    fn handle(&self) -> &ApartmentHandle;

    /// Submit asynchronous work to the apartment's execution context.
    ///
    /// The body's fault is recorded into the aggregator *and* carried by the
    /// returned future, so a caller can observe it immediately or defer to bulk
    /// shutdown — both views see the same [`Fault`].
    fn run<F, Fut, T>(&self, body: F) -> RunHandle<T>
    where
        F: FnOnce(ApartmentHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        ApartmentCore::submit(self.handle().core(), body, None)
    }

    /// [`run`](Apartment::run) with a cancellation signal: aborting resolves the
    /// returned future with [`RunError::Cancelled`] without recording a fault.
    fn run_abortable<F, Fut, T>(&self, body: F, registration: AbortRegistration) -> RunHandle<T>
    where
        F: FnOnce(ApartmentHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        ApartmentCore::submit(self.handle().core(), body, Some(registration))
    }

    /// Submit synchronous work to the apartment's execution context.
    fn run_sync<F, T>(&self, body: F) -> RunHandle<T>
    where
        F: FnOnce(ApartmentHandle) -> Result<T, anyhow::Error> + Send + 'static,
        T: Send + 'static,
    {
        ApartmentCore::submit(
            self.handle().core(),
            move |handle| std::future::ready(body(handle)),
            None,
        )
    }

    /// Fire-and-forget submission: tracked by a scope, faults captured into the
    /// aggregator, no handle returned.
    fn spawn_background<Fut>(&self, future: Fut)
    where
        Fut: Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        drop(ApartmentCore::submit(self.handle().core(), move |_| future, None));
    }

    /// RAII guard tracking one unit of background work.
    fn create_scope(&self) -> AsyncScope {
        AsyncScope::new(Arc::clone(self.handle().core()))
    }

    /// Commence completion.
    ///
    /// Idempotent. Conclusion may be further deferred until the last outstanding
    /// background operation has completed; a variant that cannot observe background
    /// work concludes immediately.
    fn complete(&self) {
        self.handle().core().complete();
    }

    /// The terminal future: resolves exactly once, to success or to a fault
    /// aggregating every captured exception. Any number of callers may await it.
    fn completion(&self) -> impl Future<Output = Result<(), AggregateError>> + Send + 'static {
        self.handle().core().completion()
    }

    /// Resolves when outstanding background work reaches zero after completion has
    /// commenced.
    fn drained(&self) -> impl Future<Output = ()> + Send + 'static {
        self.handle().core().drained()
    }

    /// Whether any background operation is outstanding; `None` when this variant
    /// cannot observe background work.
    fn any_background_operation(&self) -> Option<bool> {
        self.handle().core().any_background_operation()
    }

    fn is_completion_commenced(&self) -> bool {
        self.handle().core().is_completion_commenced()
    }

    /// All captured faults, in discovery order. Retained until
    /// [`clear_faults`](Apartment::clear_faults).
    fn faults(&self) -> Vec<Fault> {
        self.handle().core().faults()
    }

    /// Clear the fault list; otherwise a later teardown re-raises the same faults.
    fn clear_faults(&self) {
        self.handle().core().clear_faults();
    }
}

/// Shared tail of graceful teardown: the awaited completion error was swallowed by
/// the caller; what gets re-raised is the retained fault set, which the caller may
/// already have observed and cleared.
pub(crate) fn finish_shutdown(handle: &ApartmentHandle) -> Result<(), AggregateError> {
    let faults = handle.core().faults();
    if faults.is_empty() {
        Ok(())
    } else {
        Err(AggregateError::new(faults))
    }
}
