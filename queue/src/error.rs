// src/error.rs

use core::fmt;

/// Error returned by a [`Dequeue`](crate::Dequeue) future when its wait was
/// abandoned before an item was matched to it.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DequeueError {
  /// The cancellation token supplied to
  /// [`dequeue_with_cancel`](crate::AsyncQueue::dequeue_with_cancel) fired
  /// before an item arrived.
  Cancelled,
}

impl std::error::Error for DequeueError {}
impl fmt::Display for DequeueError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DequeueError::Cancelled => write!(f, "dequeue cancelled before an item arrived"),
    }
  }
}

/// Error returned by [`try_dequeue`](crate::AsyncQueue::try_dequeue) when no
/// item could be taken immediately.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TryDequeueError {
  Empty,
}

impl std::error::Error for TryDequeueError {}
impl fmt::Display for TryDequeueError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TryDequeueError::Empty => write!(f, "queue empty"),
    }
  }
}
