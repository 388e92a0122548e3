//! Utilities for asynchronous operations and wakers.

// Re-export AtomicWaker from futures-util for internal crate use.
pub(crate) use futures_util::task::AtomicWaker;
