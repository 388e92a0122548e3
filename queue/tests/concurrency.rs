mod common;
use common::*;

use fibre_queue::{AsyncQueue, CancellationToken, DequeueError};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Barrier};
use std::thread;
use tokio::time::timeout;

// --- Helper Function for MPMC Tests ---
async fn run_mpmc_test(num_producers: usize, num_consumers: usize, items_per_producer: usize) {
  // `None` is the stop marker for consumers.
  let queue = Arc::new(AsyncQueue::<Option<usize>>::new());
  let total_items_expected = num_producers * items_per_producer;
  let received_items_set = Arc::new(tokio::sync::Mutex::new(HashSet::new()));
  let received_count = Arc::new(AtomicUsize::new(0));

  // --- Spawn Consumers ---
  let mut consumer_handles = Vec::new();
  for _ in 0..num_consumers {
    let queue = Arc::clone(&queue);
    let received_set_clone = Arc::clone(&received_items_set);
    let received_count_clone = Arc::clone(&received_count);

    consumer_handles.push(tokio::spawn(async move {
      while let Ok(Some(item)) = queue.dequeue().await {
        assert!(received_set_clone.lock().await.insert(item), "Duplicate item received!");
        received_count_clone.fetch_add(1, AtomicOrdering::Relaxed);
      }
    }));
  }

  // --- Spawn Producers on plain threads ---
  let mut producer_handles = Vec::new();
  for p_id in 0..num_producers {
    let queue = Arc::clone(&queue);
    producer_handles.push(thread::spawn(move || {
      for i in 0..items_per_producer {
        queue.enqueue(Some(p_id * items_per_producer + i));
        if i % 16 == 0 {
          thread::yield_now();
        }
      }
    }));
  }

  for handle in producer_handles {
    handle.join().expect("Producer thread panicked");
  }
  for _ in 0..num_consumers {
    queue.enqueue(None);
  }

  for handle in consumer_handles {
    timeout(STRESS_TIMEOUT, handle)
      .await
      .expect("Consumer stalled")
      .expect("Consumer task panicked");
  }

  assert_eq!(received_count.load(AtomicOrdering::Relaxed), total_items_expected);
  assert_eq!(received_items_set.lock().await.len(), total_items_expected);
  assert!(queue.is_empty());
  assert_eq!(queue.waiting(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mpmc_1p_1c() {
  run_mpmc_test(1, 1, ITEMS_HIGH).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mpmc_mp_1c() {
  run_mpmc_test(4, 1, ITEMS_HIGH).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mpmc_1p_mc() {
  run_mpmc_test(1, 4, ITEMS_HIGH).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mpmc_mp_mc_contention() {
  run_mpmc_test(8, 8, ITEMS_HIGH).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_producer_single_consumer_keeps_fifo() {
  let queue = Arc::new(AsyncQueue::new());

  let producer = {
    let queue = Arc::clone(&queue);
    thread::spawn(move || {
      for i in 0..ITEMS_HIGH {
        queue.enqueue(i);
      }
    })
  };

  for expected in 0..ITEMS_HIGH {
    let item = timeout(LONG_TIMEOUT, queue.dequeue())
      .await
      .expect("dequeue stalled");
    assert_eq!(item, Ok(expected));
  }
  producer.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_and_enqueue_race_has_one_outcome() {
  let queue = Arc::new(AsyncQueue::new());

  for i in 0..ITEMS_HIGH {
    let token = CancellationToken::new();
    let consumer = queue.dequeue_with_cancel(&token);
    let barrier = Arc::new(Barrier::new(2));

    let canceller = {
      let token = token.clone();
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        token.cancel();
      })
    };
    let producer = {
      let queue = Arc::clone(&queue);
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        queue.enqueue(i);
      })
    };
    canceller.join().unwrap();
    producer.join().unwrap();

    match timeout(SHORT_TIMEOUT, consumer).await.expect("waiter never resolved") {
      Ok(item) => {
        assert_eq!(item, i);
        assert_eq!(queue.len(), 0);
      }
      Err(DequeueError::Cancelled) => {
        // Cancellation won, so the item must still be resting.
        assert_eq!(queue.try_dequeue(), Ok(i));
      }
    }
    assert_eq!(queue.waiting(), 0);
    assert!(queue.is_empty());
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancellation_never_loses_or_duplicates() {
  const WAITERS: usize = ITEMS_MEDIUM;
  let queue = Arc::new(AsyncQueue::new());

  let tokens: Vec<_> = (0..WAITERS).map(|_| CancellationToken::new()).collect();
  let consumers: Vec<_> = tokens.iter().map(|t| queue.dequeue_with_cancel(t)).collect();
  assert_eq!(queue.waiting(), WAITERS);

  let barrier = Arc::new(Barrier::new(2));
  let canceller = {
    let odd_tokens: Vec<_> = tokens.iter().skip(1).step_by(2).cloned().collect();
    let barrier = Arc::clone(&barrier);
    thread::spawn(move || {
      barrier.wait();
      for token in odd_tokens {
        token.cancel();
      }
    })
  };
  let producer = {
    let queue = Arc::clone(&queue);
    let barrier = Arc::clone(&barrier);
    thread::spawn(move || {
      barrier.wait();
      for i in 0..WAITERS {
        queue.enqueue(i);
      }
    })
  };
  canceller.join().unwrap();
  producer.join().unwrap();

  let mut delivered = HashSet::new();
  let mut cancelled = 0;
  for (idx, consumer) in consumers.into_iter().enumerate() {
    match timeout(SHORT_TIMEOUT, consumer).await.expect("waiter never resolved") {
      Ok(item) => assert!(delivered.insert(item), "item {} delivered twice", item),
      Err(DequeueError::Cancelled) => {
        assert_eq!(idx % 2, 1, "only odd waiters had their token fired");
        cancelled += 1;
      }
    }
  }

  while let Ok(item) = queue.try_dequeue() {
    assert!(delivered.insert(item), "item {} both delivered and resting", item);
  }

  assert_eq!(delivered.len(), WAITERS);
  assert!(cancelled <= WAITERS / 2);
  assert_eq!(queue.waiting(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_waiters_do_not_accumulate() {
  let queue = AsyncQueue::<usize>::new();

  for _ in 0..ITEMS_HIGH {
    let token = CancellationToken::new();
    let consumer = queue.dequeue_with_cancel(&token);
    token.cancel();
    assert_eq!(consumer.await, Err(DequeueError::Cancelled));
  }
  assert_eq!(queue.waiting(), 0);

  for _ in 0..ITEMS_HIGH {
    let _ = timeout(std::time::Duration::from_micros(50), queue.dequeue()).await;
  }
  assert_eq!(queue.waiting(), 0);
}
