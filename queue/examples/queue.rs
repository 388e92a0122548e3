// examples/queue.rs
use fibre_queue::{AsyncQueue, CancellationToken, DequeueError};
use std::{sync::Arc, thread, time::Duration};

fn main() {
  let runtime = tokio::runtime::Runtime::new().unwrap();

  println!("--- Items resting before consumers arrive ---");
  runtime.block_on(async {
    let queue = AsyncQueue::new();
    queue.enqueue("first");
    queue.enqueue("second");
    println!("[Main] Queue holds {} items", queue.len());

    while let Ok(item) = queue.try_dequeue() {
      println!("[Main] Took: {}", item);
    }
  });

  println!("\n--- Consumers waiting on producer threads ---");
  runtime.block_on(async {
    let queue = Arc::new(AsyncQueue::<String>::new());
    let num_consumers = 3;

    let mut consumers = Vec::new();
    for id in 0..num_consumers {
      let queue = Arc::clone(&queue);
      consumers.push(tokio::spawn(async move {
        let item = queue.dequeue().await.unwrap();
        println!("[Consumer {}] Received: {}", id, item);
      }));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    println!("[Main] {} consumers waiting", queue.waiting());

    let producer = {
      let queue = Arc::clone(&queue);
      thread::spawn(move || {
        for i in 0..num_consumers {
          queue.enqueue(format!("message-{}", i));
          thread::sleep(Duration::from_millis(10));
        }
      })
    };

    producer.join().unwrap();
    for consumer in consumers {
      consumer.await.unwrap();
    }
  });

  println!("\n--- Abandoning a wait with a cancellation token ---");
  runtime.block_on(async {
    let queue = AsyncQueue::new();
    let token = CancellationToken::new();

    let abandoned = queue.dequeue_with_cancel(&token);
    let patient = queue.dequeue();

    token.cancel();
    queue.enqueue(42);

    match abandoned.await {
      Err(DequeueError::Cancelled) => println!("[Main] First consumer gave up"),
      Ok(v) => println!("[Main] First consumer unexpectedly got {}", v),
    }
    println!("[Main] Second consumer got {}", patient.await.unwrap());
  });
}
