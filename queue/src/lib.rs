//! An unbounded, thread-safe FIFO queue with asynchronous, cancellable dequeue.
//!
//! Producers push items from any thread without blocking. Consumers ask for the
//! next item and get a future that is ready immediately when an item is
//! resting in the queue, or resolves once one arrives. A wait can be abandoned
//! through a [`CancellationToken`] or simply by dropping the future; either
//! way, an item is never lost and never delivered twice.

pub mod error;
pub mod queue;
pub mod telemetry;

// Internal utilities - not part of public API but exposed for crate use
mod async_util;
mod internal;

pub use error::{DequeueError, TryDequeueError};
pub use queue::{AsyncQueue, Dequeue, DequeueStream};
pub use tokio_util::sync::CancellationToken;

#[cfg(doctest)]
#[doc = include_str!("../README.md")]
struct ReadmeDoctests;

// Helper function to check if a type is Send + Sync.
#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
