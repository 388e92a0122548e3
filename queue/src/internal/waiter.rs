//! The single-assignment cell behind every pending dequeue.
//!
//! A `Waiter` starts `Pending` and transitions exactly once, either to
//! `Fulfilled` (an item was handed to it by the matching loop) or to
//! `Cancelled` (its cancellation token fired, or its future was dropped).
//! A waiter may carry the token it was registered with, so the matching loop
//! can see a fired token before it offers an item.
//! Both transitions are a compare-and-set on the same atomic, so whichever
//! side gets there first wins and the loser observes the failure.

use crate::async_util::AtomicWaker;
use crate::error::DequeueError;

use parking_lot::Mutex;
use std::fmt;
use tokio_util::sync::CancellationToken;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

// State constants for Waiter::state
pub(crate) const STATE_PENDING: u8 = 0;
pub(crate) const STATE_FULFILLED: u8 = 1;
pub(crate) const STATE_CANCELLED: u8 = 2;

pub(crate) struct Waiter<T> {
  state: AtomicU8,
  // Written only by the winner of PENDING -> FULFILLED, while holding the lock
  // across the CAS, so a reader that sees FULFILLED blocks until the item lands.
  slot: Mutex<Option<T>>,
  waker: AtomicWaker,
  token: Option<CancellationToken>,
}

impl<T> fmt::Debug for Waiter<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state_str = match self.state.load(Ordering::Relaxed) {
      STATE_PENDING => "Pending",
      STATE_FULFILLED => "Fulfilled",
      STATE_CANCELLED => "Cancelled",
      _ => "Unknown",
    };
    f.debug_struct("Waiter")
      .field("state", &state_str)
      .field("cancellable", &self.token.is_some())
      .finish_non_exhaustive()
  }
}

impl<T> Waiter<T> {
  pub(crate) fn new(token: Option<CancellationToken>) -> Self {
    Waiter {
      slot: Mutex::new(None),
      state: AtomicU8::new(STATE_PENDING),
      waker: AtomicWaker::new(),
      token,
    }
  }

  #[inline]
  pub(crate) fn state(&self) -> u8 {
    self.state.load(Ordering::Acquire)
  }

  #[inline]
  pub(crate) fn is_pending(&self) -> bool {
    self.state() == STATE_PENDING
  }

  /// Attempts `Pending -> Fulfilled(item)`.
  ///
  /// On failure the waiter has already been cancelled and the item is handed
  /// back untouched. Does not wake the consumer; callers wake after releasing
  /// whatever lock they hold.
  pub(crate) fn try_fulfill(&self, item: T) -> Result<(), T> {
    let mut slot = self.slot.lock();
    if self
      .state
      .compare_exchange(
        STATE_PENDING,
        STATE_FULFILLED,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      return Err(item);
    }
    *slot = Some(item);
    Ok(())
  }

  /// Attempts `Pending -> Cancelled` and wakes the consumer if it won.
  ///
  /// Safe to call from any thread without holding the queue's lock.
  pub(crate) fn try_cancel(&self) -> bool {
    if self
      .state
      .compare_exchange(
        STATE_PENDING,
        STATE_CANCELLED,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_ok()
    {
      self.waker.wake();
      true
    } else {
      false
    }
  }

  /// Returns `true` if this waiter's token has fired, whether or not the
  /// cancellation has been applied to the state yet.
  #[inline]
  pub(crate) fn is_signalled(&self) -> bool {
    self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
  }

  /// Applies a fired token to the state. Returns `true` if the waiter ends up
  /// cancelled, either by this call or an earlier one.
  pub(crate) fn cancel_if_signalled(&self) -> bool {
    if self.is_signalled() {
      self.try_cancel();
    }
    self.state() == STATE_CANCELLED
  }

  #[inline]
  pub(crate) fn wake(&self) {
    self.waker.wake();
  }

  /// Takes the delivered item, if this waiter was fulfilled and the item has
  /// not been taken yet.
  pub(crate) fn take_item(&self) -> Option<T> {
    if self.state() == STATE_FULFILLED {
      self.slot.lock().take()
    } else {
      None
    }
  }

  fn outcome(&self) -> Option<Result<T, DequeueError>> {
    match self.state() {
      STATE_FULFILLED => self.slot.lock().take().map(Ok),
      STATE_CANCELLED => Some(Err(DequeueError::Cancelled)),
      _ => None,
    }
  }

  pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<T, DequeueError>> {
    if let Some(outcome) = self.outcome() {
      return Poll::Ready(outcome);
    }

    self.waker.register(cx.waker());

    // Re-check after registering, the transition may have raced the register.
    match self.outcome() {
      Some(outcome) => Poll::Ready(outcome),
      None => Poll::Pending,
    }
  }
}
