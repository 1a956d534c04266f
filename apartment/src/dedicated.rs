//! Apartment owning a dedicated thread with a blocking dispatch loop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::apartment::{Apartment, ApartmentHandle, FaultHook, finish_shutdown};
use crate::core::{ApartmentCore, Concluder, Job, Scheduler, Tracking, panic_error};
use crate::error::{AggregateError, StartupError};

const DEFAULT_THREAD_NAME: &str = "apartment-loop";

/// Owns one dedicated thread running a blocking dispatch loop for its entire
/// lifetime; submissions marshal onto that thread and interleave on its
/// current-thread runtime.
///
/// Fire-and-forget launches inside a dispatch loop are not reliably countable, so
/// `any_background_operation` is `None` and `complete` concludes immediately; work
/// queued after that but not yet picked up resolves
/// [`Abandoned`](crate::error::RunError::Abandoned). This is a deliberate
/// relaxation, not a tracking bug: callers needing strict drain semantics should use
/// a [`PooledApartment`](crate::PooledApartment).
pub struct DedicatedThreadApartment {
    handle: ApartmentHandle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Options for a [`DedicatedThreadApartment`].
pub struct DedicatedThreadApartmentBuilder {
    thread_name: String,
    fault_hook: Option<FaultHook>,
}

impl Default for DedicatedThreadApartmentBuilder {
    fn default() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            fault_hook: None,
        }
    }
}

impl DedicatedThreadApartmentBuilder {
    /// Name for the owned loop thread.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Observer invoked for every captured fault.
    #[must_use]
    pub fn fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    /// Start the loop thread and block until it reports readiness.
    ///
    /// A thread that fails to start surfaces here, synchronously, never in the
    /// aggregator — there is no apartment to aggregate into yet.
    pub fn build(self) -> Result<DedicatedThreadApartment, StartupError> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (quit_tx, quit_rx) = oneshot::channel();
        let core = ApartmentCore::new(
            Scheduler::Loop(job_tx),
            Concluder::Quit(Mutex::new(Some(quit_tx))),
            Tracking::Unobservable,
            self.fault_hook,
        );

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let loop_core = Arc::clone(&core);
        let thread = thread::Builder::new()
            .name(self.thread_name)
            .spawn(move || dispatch_loop(&loop_core, job_rx, quit_rx, &ready_tx))
            .map_err(StartupError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(startup)) => {
                let _ = thread.join();
                return Err(startup);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(StartupError::Handshake);
            }
        }

        Ok(DedicatedThreadApartment {
            handle: ApartmentHandle::new(core),
            thread: Some(thread),
        })
    }
}

impl DedicatedThreadApartment {
    #[must_use]
    pub fn builder() -> DedicatedThreadApartmentBuilder {
        DedicatedThreadApartmentBuilder::default()
    }

    /// Dedicated apartment with default options.
    pub fn new() -> Result<Self, StartupError> {
        Self::builder().build()
    }

    /// Graceful teardown: conclude, wait for the loop thread to exit, then re-raise
    /// the full retained fault set.
    pub async fn shutdown(mut self) -> Result<(), AggregateError> {
        self.complete();
        let _ = self.completion().await;
        self.join_loop();
        finish_shutdown(&self.handle)
    }

    fn join_loop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // The loop resolves completion as its final act, so once that signal has
            // fired this join returns immediately.
            if thread.join().is_err() {
                error!("apartment thread terminated abnormally");
            }
        }
    }
}

impl Apartment for DedicatedThreadApartment {
    fn handle(&self) -> &ApartmentHandle {
        &self.handle
    }
}

impl Drop for DedicatedThreadApartment {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let faults = self.faults();
            if !faults.is_empty() {
                warn!(count = faults.len(), "apartment dropped with unobserved faults");
            }
            self.complete();
            self.join_loop();
        }
    }
}

impl std::fmt::Debug for DedicatedThreadApartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedThreadApartment")
            .finish_non_exhaustive()
    }
}

/// The blocking dispatch loop: pump jobs onto a current-thread runtime until asked
/// to quit, then resolve completion as the thread's final act.
fn dispatch_loop(
    core: &Arc<ApartmentCore>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    mut quit: oneshot::Receiver<()>,
    ready: &std::sync::mpsc::Sender<Result<(), StartupError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready.send(Err(StartupError::Runtime(err)));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    debug!("dispatch loop ready");

    let pump = AssertUnwindSafe(move || {
        runtime.block_on(async {
            loop {
                tokio::select! {
                    _ = &mut quit => break,
                    job = jobs.recv() => match job {
                        Some(job) => {
                            drop(tokio::spawn(job));
                        }
                        None => break,
                    },
                }
            }
        });
        // Dropping the runtime cancels whatever the loop left in flight; each
        // dropped job releases its scope on the way out.
        drop(runtime);
    });
    if let Err(payload) = std::panic::catch_unwind(pump) {
        let _ = core.record_fault(panic_error(payload));
    }

    debug!("dispatch loop exited");
    core.resolve_completion();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;

    #[tokio::test]
    async fn test_runs_on_the_dedicated_thread() {
        let apartment = DedicatedThreadApartment::builder()
            .thread_name("clipboard-loop")
            .build()
            .unwrap();

        let name = apartment
            .run(|_| async { Ok(thread::current().name().map(ToString::to_string)) })
            .await
            .unwrap();

        assert_eq!(name.as_deref(), Some("clipboard-loop"));
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tracking_is_unobservable() {
        let apartment = DedicatedThreadApartment::new().unwrap();
        let _scope = apartment.create_scope();
        assert_eq!(apartment.any_background_operation(), None);
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_work_after_complete_is_abandoned() {
        let apartment = DedicatedThreadApartment::new().unwrap();
        apartment.complete();
        apartment.completion().await.unwrap();

        let err = apartment.run(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, RunError::Abandoned));
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_interleave_on_one_thread() {
        // Two submissions that ping-pong; they can only both finish if the loop runs
        // them concurrently rather than to completion one at a time.
        let apartment = DedicatedThreadApartment::new().unwrap();
        let (tx_a, rx_a) = tokio::sync::oneshot::channel::<()>();
        let (tx_b, rx_b) = tokio::sync::oneshot::channel::<()>();

        let first = apartment.run(move |_| async move {
            let _ = tx_a.send(());
            rx_b.await?;
            Ok(())
        });
        let second = apartment.run(move |_| async move {
            rx_a.await?;
            let _ = tx_b.send(());
            Ok(())
        });

        first.await.unwrap();
        second.await.unwrap();
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_faults_surface_at_shutdown() {
        let apartment = DedicatedThreadApartment::new().unwrap();
        let _ = apartment
            .run(|_| async { Err::<(), _>(anyhow::anyhow!("loop fault")) })
            .await;

        let err = apartment.shutdown().await.unwrap_err();
        assert_eq!(err.faults().len(), 1);
        assert_eq!(err.faults()[0].to_string(), "loop fault");
    }
}
