//! Apartment-model concurrency: execution contexts paired with fault aggregation
//! and background-operation tracking.
//!
//! An apartment binds a stream of asynchronous work items to a single logical
//! execution context, tracks fire-and-forget background operations so shutdown can
//! be deferred until they drain, and aggregates every fault raised inside it into
//! one observable failure.
//!
//! - [`PooledApartment`] submits work to a shared tokio worker pool; every
//!   submission is individually wrapped, so outstanding background work is fully
//!   countable.
//! - [`DedicatedThreadApartment`] owns a single thread pumping a blocking dispatch
//!   loop, for work that must stay on one thread.
//!
//! Bodies receive an explicit [`ApartmentHandle`] instead of discovering their
//! context through ambient thread-local state; fire-and-forget sub-operations stay
//! tracked by going through [`Apartment::spawn_background`] or holding an
//! [`AsyncScope`].
//!
//! ```no_run
//! use apartment::{Apartment, PooledApartment};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let apartment = PooledApartment::try_current()?;
//! let value = apartment
//!     .run(|handle| async move {
//!         handle.spawn_background(async {
//!             // Tracked: shutdown waits for this to finish.
//!             Ok(())
//!         });
//!         Ok(2 + 2)
//!     })
//!     .await?;
//! assert_eq!(value, 4);
//! apartment.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Faults never crash the apartment's context: they are captured into the
//! aggregator and surface once, aggregated, from [`Apartment::completion`] or from
//! `shutdown` — and immediately from the `run` future for callers that await it
//! directly. Cancellation is expected, not a defect, and is never aggregated.

pub mod aggregator;
mod apartment;
mod core;
mod dedicated;
pub mod error;
mod pooled;
pub mod tracker;

pub use aggregator::FaultAggregator;
pub use apartment::{Apartment, ApartmentHandle, AsyncScope, FaultHook, RunHandle};
pub use dedicated::{DedicatedThreadApartment, DedicatedThreadApartmentBuilder};
pub use error::{AggregateError, Fault, RunError, StartupError, TrackerInvariantError};
pub use pooled::{PooledApartment, PooledApartmentBuilder};
pub use tracker::BackgroundTracker;
