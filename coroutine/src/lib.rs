//! A rendezvous proxy pairing two asynchronous sequences so each can await the
//! other's next value before proceeding.
//!
//! One side *drives* the proxy with a producer sequence; the other side
//! *subscribes* and pulls values in exact production order. Driving publishes the
//! consumable sequence through a single-resolution handshake, so the subscriber may
//! be waiting before the producer even starts. Two proxies wired in opposite
//! directions script deterministic two-party interleavings: coroutine A awaits the
//! proxy to B before acting, yields a value, then awaits B's reply.
//!
//! The proxy has no ownership relation to an apartment, but is typically driven
//! inside one to guarantee asynchronous continuation semantics.

mod error;
mod proxy;

pub use error::CoroutineError;
pub use proxy::{CoroutineConsumer, CoroutineProxy};
