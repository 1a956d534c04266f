//! Apartment over a shared tokio worker pool.

use tokio::runtime::Handle;
use tracing::warn;

use crate::apartment::{Apartment, ApartmentHandle, FaultHook, finish_shutdown};
use crate::core::{ApartmentCore, Concluder, Scheduler, Tracking};
use crate::error::{AggregateError, StartupError};

/// Submits every unit of work to a shared tokio worker pool, individually wrapped in
/// start/complete tracking, so outstanding background work is fully countable and
/// `any_background_operation` is never unknown.
///
/// The pool itself is shared, not owned: conclusion simply resolves the completion
/// signal, there is no thread to tear down.
pub struct PooledApartment {
    handle: ApartmentHandle,
}

/// Options for a [`PooledApartment`].
#[derive(Default)]
pub struct PooledApartmentBuilder {
    runtime: Option<Handle>,
    fault_hook: Option<FaultHook>,
}

impl PooledApartmentBuilder {
    /// Pool to submit to; defaults to the ambient runtime at build time.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Observer invoked for every captured fault.
    #[must_use]
    pub fn fault_hook(mut self, hook: FaultHook) -> Self {
        self.fault_hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<PooledApartment, StartupError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(StartupError::NoRuntime)?,
        };
        let core = ApartmentCore::new(
            Scheduler::Pool(runtime),
            Concluder::Resolve,
            Tracking::Counted,
            self.fault_hook,
        );
        Ok(PooledApartment {
            handle: ApartmentHandle::new(core),
        })
    }
}

impl PooledApartment {
    #[must_use]
    pub fn builder() -> PooledApartmentBuilder {
        PooledApartmentBuilder::default()
    }

    /// Apartment over the ambient tokio runtime; fails synchronously when there is
    /// none.
    pub fn try_current() -> Result<Self, StartupError> {
        Self::builder().build()
    }

    /// Graceful teardown: commence completion, await it while swallowing its error
    /// locally, then re-raise the full retained fault set.
    pub async fn shutdown(self) -> Result<(), AggregateError> {
        self.complete();
        let _ = self.completion().await;
        finish_shutdown(&self.handle)
    }
}

impl Apartment for PooledApartment {
    fn handle(&self) -> &ApartmentHandle {
        &self.handle
    }
}

impl Drop for PooledApartment {
    fn drop(&mut self) {
        if !self.handle.core().is_concluded() {
            let faults = self.faults();
            if !faults.is_empty() {
                warn!(count = faults.len(), "apartment dropped with unobserved faults");
            }
            self.complete();
        }
    }
}

impl std::fmt::Debug for PooledApartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledApartment").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::{Fault, RunError};

    #[tokio::test]
    async fn test_run_returns_value() {
        let apartment = PooledApartment::try_current().unwrap();
        let value = apartment.run(|_| async { Ok(6 * 7) }).await.unwrap();
        assert_eq!(value, 42);
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_sync_returns_value() {
        let apartment = PooledApartment::try_current().unwrap();
        let value = apartment.run_sync(|_| Ok("pooled".len())).await.unwrap();
        assert_eq!(value, 6);
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scopes_count_until_last_release() {
        let apartment = PooledApartment::try_current().unwrap();
        let scopes: Vec<_> = (0..4).map(|_| apartment.create_scope()).collect();
        assert_eq!(apartment.any_background_operation(), Some(true));

        for (released, scope) in scopes.into_iter().enumerate() {
            drop(scope);
            assert_eq!(apartment.any_background_operation(), Some(released < 3));
        }

        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let apartment = PooledApartment::try_current().unwrap();
        apartment.complete();
        apartment.complete();
        apartment.completion().await.unwrap();

        apartment.complete();
        apartment.completion().await.unwrap();
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_visible_from_run_and_completion() {
        let apartment = PooledApartment::try_current().unwrap();
        let err = apartment
            .run(|_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        match err {
            RunError::Fault(fault) => assert_eq!(fault.to_string(), "boom"),
            other => panic!("expected fault, got {other:?}"),
        }

        apartment.complete();
        let aggregate = apartment.completion().await.unwrap_err();
        assert_eq!(aggregate.faults().len(), 1);
        assert_eq!(aggregate.faults()[0].to_string(), "boom");

        apartment.clear_faults();
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_fault() {
        let apartment = PooledApartment::try_current().unwrap();
        let err = apartment
            .run(|_| async {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            RunError::Fault(fault) => assert!(fault.to_string().contains("kaboom")),
            other => panic!("expected fault, got {other:?}"),
        }
        apartment.clear_faults();
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_background_defers_completion() {
        let apartment = PooledApartment::try_current().unwrap();
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        apartment
            .run(move |handle| async move {
                handle.spawn_background(async move {
                    let _ = gate_rx.await;
                    Ok(())
                });
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(apartment.any_background_operation(), Some(true));
        apartment.complete();
        assert!(apartment.is_completion_commenced());
        // Not yet concluded: the background operation still holds its scope.
        assert_eq!(apartment.any_background_operation(), Some(true));

        gate_tx.send(()).unwrap();
        apartment.completion().await.unwrap();
        assert_eq!(apartment.any_background_operation(), Some(false));
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_run_is_not_aggregated() {
        let apartment = PooledApartment::try_current().unwrap();
        let (abort, registration) = futures_util::future::AbortHandle::new_pair();
        let handle = apartment.run_abortable(
            |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            registration,
        );

        abort.abort();
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(apartment.faults().is_empty());
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_hook_sees_every_fault() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observer = Arc::clone(&seen);
        let apartment = PooledApartment::builder()
            .fault_hook(Arc::new(move |_: &Fault| {
                observer.fetch_add(1, Ordering::SeqCst);
            }))
            .build()
            .unwrap();

        let _ = apartment
            .run(|_| async { Err::<(), _>(anyhow::anyhow!("one")) })
            .await;
        let _ = apartment
            .run(|_| async { Err::<(), _>(anyhow::anyhow!("two")) })
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        apartment.clear_faults();
        apartment.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_nested_run_reaches_the_same_apartment() {
        let apartment = PooledApartment::try_current().unwrap();
        let value = apartment
            .run(|handle| async move {
                let inner = handle.run(|_| async { Ok(21) }).await?;
                Ok(inner * 2)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        apartment.shutdown().await.unwrap();
    }
}
