//! Shared apartment state: the single lock, the completion protocol, and the
//! wrapping of submitted work.
//!
//! Every mutation of the background counter, the fault list, and the
//! completion-commenced flag happens under one mutex per apartment. Decisions are
//! made under the lock; signalling and conclusion happen after it is released, so no
//! lock is ever held across a suspension point.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{AbortRegistration, Abortable, Aborted, BoxFuture};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error};

use crate::aggregator::FaultAggregator;
use crate::apartment::{ApartmentHandle, AsyncScope, FaultHook, RunHandle};
use crate::error::{AggregateError, Fault, RunError};
use crate::tracker::BackgroundTracker;

/// A unit of work already wrapped for tracking, ready for an execution context.
pub(crate) type Job = BoxFuture<'static, ()>;

/// How submissions reach the apartment's execution context.
pub(crate) enum Scheduler {
    /// Shared worker pool: every job becomes an independent pool task.
    Pool(tokio::runtime::Handle),
    /// Dedicated dispatch loop: jobs are queued to the loop thread.
    Loop(mpsc::UnboundedSender<Job>),
}

impl Scheduler {
    fn submit(&self, job: Job) {
        match self {
            Self::Pool(handle) => {
                drop(handle.spawn(job));
            }
            Self::Loop(sender) => {
                if sender.send(job).is_err() {
                    // The loop already exited; the dropped job releases its scope and
                    // its RunHandle resolves Abandoned.
                    debug!("dispatch loop gone; submission abandoned");
                }
            }
        }
    }
}

/// What conclusion does once commenced work has drained.
pub(crate) enum Concluder {
    /// Resolve the completion signal directly; there is no owned thread to tear
    /// down.
    Resolve,
    /// Ask the dispatch loop to exit; the loop thread resolves completion as its
    /// final act, so the signal never fires while the loop is still pumping.
    Quit(Mutex<Option<oneshot::Sender<()>>>),
}

/// Whether this variant can observe its outstanding background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tracking {
    Counted,
    Unobservable,
}

#[derive(Debug, Default)]
struct CoreState {
    tracker: BackgroundTracker,
    faults: FaultAggregator,
    completion_commenced: bool,
    concluded: bool,
}

pub(crate) struct ApartmentCore {
    state: Mutex<CoreState>,
    scheduler: Scheduler,
    concluder: Concluder,
    tracking: Tracking,
    completion_tx: watch::Sender<Option<Result<(), AggregateError>>>,
    drained_tx: watch::Sender<bool>,
    fault_hook: Option<FaultHook>,
}

impl ApartmentCore {
    pub(crate) fn new(
        scheduler: Scheduler,
        concluder: Concluder,
        tracking: Tracking,
        fault_hook: Option<FaultHook>,
    ) -> Arc<Self> {
        let (completion_tx, _) = watch::channel(None);
        let (drained_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CoreState::default()),
            scheduler,
            concluder,
            tracking,
            completion_tx,
            drained_tx,
            fault_hook,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a body to this apartment's execution context, wrapped in a tracked
    /// scope and fault capture.
    ///
    /// The scope opens at submission time, before the context picks the work up, so
    /// a `complete` racing the submission still defers to it.
    pub(crate) fn submit<F, Fut, T>(
        core: &Arc<Self>,
        body: F,
        abort: Option<AbortRegistration>,
    ) -> RunHandle<T>
    where
        F: FnOnce(ApartmentHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scope = AsyncScope::new(Arc::clone(core));
        let handle = ApartmentHandle::new(Arc::clone(core));
        let owner = Arc::clone(core);

        let job = async move {
            let _scope = scope;
            let work = AssertUnwindSafe(async move { body(handle).await }).catch_unwind();
            let outcome = match abort {
                Some(registration) => match Abortable::new(work, registration).await {
                    Ok(caught) => owner.fold_outcome(caught),
                    Err(Aborted) => Err(RunError::Cancelled),
                },
                None => owner.fold_outcome(work.await),
            };
            let _ = tx.send(outcome);
        };

        core.scheduler.submit(Box::pin(job));
        RunHandle::new(rx)
    }

    /// Map a caught body outcome to the run result, recording faults along the way.
    /// Cancellation never reaches this point; it is not a fault.
    fn fold_outcome<T>(
        &self,
        caught: Result<Result<T, anyhow::Error>, Box<dyn Any + Send>>,
    ) -> Result<T, RunError> {
        match caught {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(RunError::Fault(self.record_fault(err))),
            Err(payload) => Err(RunError::Fault(self.record_fault(panic_error(payload)))),
        }
    }

    /// Record a fault into the aggregator, then notify the logging sink and the
    /// optional hook outside the lock.
    pub(crate) fn record_fault(&self, err: anyhow::Error) -> Fault {
        let fault: Fault = Arc::new(err);
        {
            let mut state = self.lock_state();
            state.faults.push(Arc::clone(&fault));
        }
        error!(fault = %fault, "captured apartment fault");
        if let Some(hook) = &self.fault_hook {
            hook(&fault);
        }
        fault
    }

    pub(crate) fn operation_started(&self) {
        self.lock_state().tracker.started();
    }

    pub(crate) fn operation_completed(&self) {
        let (invariant, drained) = {
            let mut state = self.lock_state();
            let invariant = state.tracker.completed().err();
            let drained = self.tracking == Tracking::Counted
                && !state.tracker.outstanding()
                && state.completion_commenced
                && !state.concluded;
            (invariant, drained)
        };
        if let Some(err) = invariant {
            let _ = self.record_fault(anyhow::Error::new(err));
        }
        if drained {
            debug!("background operations drained");
            let _ = self.drained_tx.send(true);
            self.conclude();
        }
    }

    /// Commence completion. Idempotent; conclusion is deferred while countable
    /// background work is outstanding.
    pub(crate) fn complete(&self) {
        let conclude = {
            let mut state = self.lock_state();
            if state.completion_commenced {
                false
            } else {
                state.completion_commenced = true;
                debug!("completion commenced");
                // Unobservable tracking concludes immediately; counted tracking
                // defers until the tracker drains.
                self.tracking == Tracking::Unobservable || !state.tracker.outstanding()
            }
        };
        if conclude {
            self.conclude();
        }
    }

    fn conclude(&self) {
        match &self.concluder {
            Concluder::Resolve => self.resolve_completion(),
            Concluder::Quit(slot) => {
                let quit = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(quit) = quit {
                    debug!("requesting dispatch loop exit");
                    let _ = quit.send(());
                }
            }
        }
    }

    /// Resolve the completion signal exactly once, to success or the fault set
    /// aggregated so far.
    pub(crate) fn resolve_completion(&self) {
        let outcome = {
            let mut state = self.lock_state();
            if state.concluded {
                return;
            }
            state.concluded = true;
            if state.faults.is_empty() {
                Ok(())
            } else {
                Err(AggregateError::new(state.faults.snapshot()))
            }
        };
        debug!(ok = outcome.is_ok(), "apartment concluded");
        let _ = self.completion_tx.send(Some(outcome));
    }

    /// The terminal future. Resolves exactly once; any number of callers may await
    /// it, before or after resolution.
    pub(crate) fn completion(
        &self,
    ) -> impl Future<Output = Result<(), AggregateError>> + Send + 'static {
        let mut rx = self.completion_tx.subscribe();
        async move {
            match rx.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone().unwrap_or(Ok(())),
                // The apartment resolved in a drop path and the sender is gone; the
                // channel cannot close while a resolution is still pending otherwise.
                Err(_) => Ok(()),
            }
        }
    }

    /// Resolves when outstanding background work reaches zero after completion has
    /// commenced.
    pub(crate) fn drained(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.drained_tx.subscribe();
        async move {
            let _ = rx.wait_for(|drained| *drained).await;
        }
    }

    pub(crate) fn any_background_operation(&self) -> Option<bool> {
        match self.tracking {
            Tracking::Counted => Some(self.lock_state().tracker.outstanding()),
            Tracking::Unobservable => None,
        }
    }

    pub(crate) fn is_completion_commenced(&self) -> bool {
        self.lock_state().completion_commenced
    }

    pub(crate) fn is_concluded(&self) -> bool {
        self.lock_state().concluded
    }

    pub(crate) fn faults(&self) -> Vec<Fault> {
        self.lock_state().faults.snapshot()
    }

    pub(crate) fn clear_faults(&self) {
        self.lock_state().faults.clear();
    }
}

/// Convert a panic payload into a recordable fault.
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow::anyhow!("operation panicked: {message}")
}
