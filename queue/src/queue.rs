// src/queue.rs

//! An unbounded MPMC FIFO queue whose consumers wait asynchronously.
//!
//! Producers call [`AsyncQueue::enqueue`] from any thread; it never blocks
//! beyond a short critical section. Consumers call [`AsyncQueue::dequeue`] (or
//! [`AsyncQueue::dequeue_with_cancel`]) and await the returned [`Dequeue`]
//! future.
//!
//! ### Design Principles:
//!
//! 1.  **One Mutex**: a `parking_lot::Mutex` guards both the resting items and
//!     the queue of waiting consumers. Checking for an item and registering a
//!     waiter happen in the same critical section, so an item that arrives in
//!     between can never be missed.
//! 2.  **Eager Registration**: the waiter is registered when `dequeue` is
//!     called, not on first poll. Waiters are therefore served in the order
//!     their `dequeue` calls were made.
//! 3.  **Single-Assignment Waiters**: each waiter is a tri-state cell. The
//!     matching loop and the cancellation path race on the same
//!     compare-and-set; when cancellation wins, the item goes back to the head
//!     of the queue and the loop moves on to the next waiter. A waiter whose
//!     [`CancellationToken`] has already fired is skipped before any item is
//!     offered to it.
//! 4.  **Wake Outside the Lock**: fulfilled waiters are woken after the mutex is
//!     released, so a consumer task that runs inline and calls back into the
//!     queue cannot deadlock.
//!
//! # Examples
//!
//! ```
//! use fibre_queue::{AsyncQueue, CancellationToken, DequeueError};
//!
//! tokio::runtime::Runtime::new().unwrap().block_on(async {
//!     let queue = AsyncQueue::new();
//!
//!     queue.enqueue(42);
//!     assert_eq!(queue.len(), 1);
//!     assert_eq!(queue.dequeue().await, Ok(42));
//!     assert_eq!(queue.len(), 0);
//!
//!     let token = CancellationToken::new();
//!     let abandoned = queue.dequeue_with_cancel(&token);
//!     let served = queue.dequeue();
//!     token.cancel();
//!     queue.enqueue(7);
//!
//!     assert_eq!(abandoned.await, Err(DequeueError::Cancelled));
//!     assert_eq!(served.await, Ok(7));
//! });
//! ```

use crate::error::{DequeueError, TryDequeueError};
use crate::internal::waiter::{Waiter, STATE_CANCELLED};
use crate::telemetry;

use futures_core::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// State guarded by the queue's mutex.
struct QueueInner<T> {
  /// Items not yet claimed by any waiter, in delivery order.
  items: VecDeque<T>,
  /// Consumers waiting for an item, in registration order.
  waiters: VecDeque<Arc<Waiter<T>>>,
}

impl<T> QueueInner<T> {
  /// Hands resting items to waiting consumers until one side runs dry.
  ///
  /// Waiters that win an item are pushed onto `fulfilled`; the caller wakes
  /// them once the lock is released. Waiters whose token has fired are dropped
  /// from the queue untouched. A waiter that is cancelled concurrently loses
  /// the compare-and-set and its item goes back to the head.
  fn match_waiters(&mut self, fulfilled: &mut Vec<Arc<Waiter<T>>>) {
    while !self.items.is_empty() {
      let Some(waiter) = self.waiters.pop_front() else {
        break;
      };
      if waiter.cancel_if_signalled() {
        telemetry::increment_counter("AsyncQueue::match_waiters", "SkippedCancelled");
        continue;
      }
      let Some(item) = self.items.pop_front() else {
        break;
      };

      match waiter.try_fulfill(item) {
        Ok(()) => {
          telemetry::increment_counter("AsyncQueue::match_waiters", "HandedToWaiter");
          fulfilled.push(waiter);
        }
        Err(item) => {
          telemetry::increment_counter("AsyncQueue::match_waiters", "FulfillLostRace");
          self.items.push_front(item);
        }
      }
    }
  }

  fn remove_waiter(&mut self, waiter: &Arc<Waiter<T>>) -> bool {
    match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
      Some(pos) => {
        self.waiters.remove(pos);
        true
      }
      None => false,
    }
  }
}

/// What `dequeue` found inside its critical section.
enum Claim<T> {
  Item(T),
  Cancelled,
  Parked(Arc<Waiter<T>>),
}

/// An unbounded, thread-safe FIFO queue with asynchronous, cancellable dequeue.
///
/// Share it between threads behind an `Arc` (or by reference in scoped tasks).
pub struct AsyncQueue<T> {
  inner: Mutex<QueueInner<T>>,
}

impl<T> fmt::Debug for AsyncQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let guard = self.inner.lock();
    f.debug_struct("AsyncQueue")
      .field("len", &guard.items.len())
      .field("waiting", &guard.waiters.len())
      .finish()
  }
}

impl<T> Default for AsyncQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> AsyncQueue<T> {
  /// Creates an empty queue.
  pub fn new() -> Self {
    Self::with_capacity(0)
  }

  /// Creates an empty queue with room for `capacity` resting items before
  /// reallocating. The queue is still unbounded.
  pub fn with_capacity(capacity: usize) -> Self {
    AsyncQueue {
      inner: Mutex::new(QueueInner {
        items: VecDeque::with_capacity(capacity),
        waiters: VecDeque::new(),
      }),
    }
  }

  /// Appends `item` to the tail of the queue, handing it straight to the
  /// oldest waiting consumer if there is one.
  ///
  /// Never fails and never waits for a consumer.
  pub fn enqueue(&self, item: T) {
    let mut fulfilled = Vec::new();
    {
      let mut guard = self.inner.lock();
      guard.items.push_back(item);
      guard.match_waiters(&mut fulfilled);
    }
    telemetry::log_event(None, "AsyncQueue::enqueue", "Enqueued", None);

    for waiter in fulfilled {
      waiter.wake();
    }
  }

  /// Takes the head item without waiting.
  pub fn try_dequeue(&self) -> Result<T, TryDequeueError> {
    self.inner.lock().items.pop_front().ok_or(TryDequeueError::Empty)
  }

  /// Requests the next item.
  ///
  /// If an item is resting in the queue it is claimed right away and the
  /// returned future is immediately ready. Otherwise a waiter is registered
  /// now, ahead of any later `dequeue` call, and the future resolves when an
  /// item is enqueued for it.
  ///
  /// Without a cancellation token the future always resolves to `Ok`.
  /// Dropping it before completion abandons the wait; an item already handed
  /// to it is put back at the head of the queue.
  pub fn dequeue(&self) -> Dequeue<'_, T> {
    match self.claim(None) {
      Claim::Item(item) => Dequeue::new(self, DequeueState::Ready(item)),
      Claim::Cancelled => Dequeue::new(self, DequeueState::Cancelled),
      Claim::Parked(waiter) => Dequeue::new(
        self,
        DequeueState::Waiting {
          waiter,
          signal: None,
        },
      ),
    }
  }

  /// Like [`dequeue`](Self::dequeue), but the wait is abandoned with
  /// [`DequeueError::Cancelled`] if `token` fires before an item is matched.
  ///
  /// A resting item is still returned even if `token` was already cancelled.
  pub fn dequeue_with_cancel(&self, token: &CancellationToken) -> Dequeue<'_, T> {
    match self.claim(Some(token)) {
      Claim::Item(item) => Dequeue::new(self, DequeueState::Ready(item)),
      Claim::Cancelled => Dequeue::new(self, DequeueState::Cancelled),
      Claim::Parked(waiter) => Dequeue::new(
        self,
        DequeueState::Waiting {
          waiter,
          signal: Some(Box::pin(token.clone().cancelled_owned())),
        },
      ),
    }
  }

  /// Returns a stream that dequeues items one after another, forever.
  pub fn stream(&self) -> DequeueStream<'_, T> {
    DequeueStream {
      queue: self,
      pending: None,
    }
  }

  /// Number of items resting in the queue, not counting items already handed
  /// to a waiter.
  pub fn len(&self) -> usize {
    self.inner.lock().items.len()
  }

  /// Returns `true` if no item is resting in the queue.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of waiter entries currently registered.
  ///
  /// A waiter whose token has fired stays counted until its future is polled
  /// or dropped, or until the next enqueue reaches it.
  pub fn waiting(&self) -> usize {
    self.inner.lock().waiters.len()
  }

  /// The critical section of `dequeue`: claim the head item or register a
  /// waiter, as one atomic step relative to `enqueue`.
  fn claim(&self, token: Option<&CancellationToken>) -> Claim<T> {
    let mut guard = self.inner.lock();

    if let Some(item) = guard.items.pop_front() {
      drop(guard);
      telemetry::log_event(None, "AsyncQueue::dequeue", "DequeuedImmediately", None);
      return Claim::Item(item);
    }

    if token.is_some_and(CancellationToken::is_cancelled) {
      return Claim::Cancelled;
    }

    let waiter = Arc::new(Waiter::new(token.cloned()));
    guard.waiters.push_back(Arc::clone(&waiter));
    let waiting = guard.waiters.len();
    drop(guard);

    telemetry::log_event(
      Some(waiting),
      "AsyncQueue::dequeue",
      "WaiterRegistered",
      None,
    );
    Claim::Parked(waiter)
  }

  /// Drops a resolved waiter's entry so it is not visited again.
  fn forget_waiter(&self, waiter: &Arc<Waiter<T>>) {
    self.inner.lock().remove_waiter(waiter);
  }

  /// Returns an item that was claimed but never observed by its consumer to
  /// the head of the queue, then re-runs matching.
  fn requeue_front(&self, item: T) {
    let mut fulfilled = Vec::new();
    {
      let mut guard = self.inner.lock();
      guard.items.push_front(item);
      guard.match_waiters(&mut fulfilled);
    }
    telemetry::log_event(None, "AsyncQueue::requeue_front", "ItemRequeued", None);

    for waiter in fulfilled {
      waiter.wake();
    }
  }
}

enum DequeueState<T> {
  /// Claimed on the fast path, not yet handed out.
  Ready(T),
  /// The token had already fired and no item was resting.
  Cancelled,
  Waiting {
    waiter: Arc<Waiter<T>>,
    signal: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
  },
  Done,
}

/// A future resolving to the next item of an [`AsyncQueue`].
///
/// Created by [`AsyncQueue::dequeue`] and [`AsyncQueue::dequeue_with_cancel`].
#[must_use = "futures do nothing unless you .await or poll them"]
pub struct Dequeue<'a, T> {
  queue: &'a AsyncQueue<T>,
  state: DequeueState<T>,
}

// The item is never pinned in place; it is only ever moved out by value.
impl<T> Unpin for Dequeue<'_, T> {}

impl<T> fmt::Debug for Dequeue<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = match &self.state {
      DequeueState::Ready(_) => "Ready",
      DequeueState::Cancelled => "Cancelled",
      DequeueState::Waiting { .. } => "Waiting",
      DequeueState::Done => "Done",
    };
    f.debug_struct("Dequeue").field("state", &state).finish()
  }
}

impl<'a, T> Dequeue<'a, T> {
  fn new(queue: &'a AsyncQueue<T>, state: DequeueState<T>) -> Self {
    Dequeue { queue, state }
  }

  /// Returns `true` if this future can complete without waiting for an
  /// enqueue.
  pub fn is_ready(&self) -> bool {
    match &self.state {
      DequeueState::Ready(_) | DequeueState::Cancelled => true,
      DequeueState::Waiting { waiter, .. } => !waiter.is_pending() || waiter.is_signalled(),
      DequeueState::Done => false,
    }
  }
}

impl<T> Future for Dequeue<'_, T> {
  type Output = Result<T, DequeueError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.get_mut();

    match mem::replace(&mut this.state, DequeueState::Done) {
      DequeueState::Ready(item) => Poll::Ready(Ok(item)),
      DequeueState::Cancelled => Poll::Ready(Err(DequeueError::Cancelled)),
      DequeueState::Waiting { waiter, mut signal } => {
        if let Some(fired) = signal.as_mut() {
          if fired.as_mut().poll(cx).is_ready() {
            // A hand-off that already happened wins over the token.
            waiter.try_cancel();
          }
        }
        match waiter.poll_outcome(cx) {
          Poll::Ready(Ok(item)) => Poll::Ready(Ok(item)),
          Poll::Ready(Err(err)) => {
            this.queue.forget_waiter(&waiter);
            telemetry::log_event(None, "Dequeue::poll", "WaiterCancelled", None);
            Poll::Ready(Err(err))
          }
          Poll::Pending => {
            this.state = DequeueState::Waiting { waiter, signal };
            Poll::Pending
          }
        }
      }
      DequeueState::Done => panic!("`Dequeue` polled after completion"),
    }
  }
}

impl<T> Drop for Dequeue<'_, T> {
  fn drop(&mut self) {
    match mem::replace(&mut self.state, DequeueState::Done) {
      DequeueState::Ready(item) => self.queue.requeue_front(item),
      DequeueState::Waiting { waiter, .. } => {
        if waiter.try_cancel() || waiter.state() == STATE_CANCELLED {
          self.queue.forget_waiter(&waiter);
          telemetry::log_event(None, "Dequeue::drop", "WaiterAbandoned", None);
        } else if let Some(item) = waiter.take_item() {
          self.queue.requeue_front(item);
        }
      }
      DequeueState::Cancelled | DequeueState::Done => {}
    }
  }
}

/// A [`Stream`] over the items of an [`AsyncQueue`].
///
/// Created by [`AsyncQueue::stream`]. Never terminates on its own.
#[must_use = "streams do nothing unless polled"]
pub struct DequeueStream<'a, T> {
  queue: &'a AsyncQueue<T>,
  pending: Option<Dequeue<'a, T>>,
}

impl<T> fmt::Debug for DequeueStream<'_, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DequeueStream")
      .field("pending", &self.pending)
      .finish()
  }
}

impl<T> Stream for DequeueStream<'_, T> {
  type Item = T;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    let queue = this.queue;
    let pending = this.pending.get_or_insert_with(|| queue.dequeue());

    match Pin::new(pending).poll(cx) {
      Poll::Ready(result) => {
        this.pending = None;
        Poll::Ready(result.ok())
      }
      Poll::Pending => Poll::Pending,
    }
  }
}
