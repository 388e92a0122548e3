// src/telemetry.rs

//! Opt-in event tracing for the matching queue.
//!
//! With the `queue_telemetry` feature enabled, every enqueue, hand-off,
//! registration and cancellation is recorded into a process-wide collector
//! together with the OS thread and tokio task that produced it. Without the
//! feature every function here compiles to nothing.

#[cfg(feature = "queue_telemetry")]
pub mod enabled {
  use std::collections::HashMap;
  use std::fmt;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::thread::{self, ThreadId};
  use std::time::Instant;
  use tokio::task::Id as TokioTaskId;

  static NEXT_SEQ: AtomicUsize = AtomicUsize::new(0);

  /// One recorded queue event.
  #[derive(Clone)]
  pub struct QueueEvent {
    pub seq: usize,
    pub at: Instant,
    pub os_thread: ThreadId,
    pub task: Option<TokioTaskId>,
    /// Numeric subject of the event, when the call site has one. Waiter
    /// registrations record the number of waiters queued after the push.
    pub subject: Option<usize>,
    pub location: &'static str,
    pub kind: &'static str,
    pub detail: Option<String>,
  }

  impl fmt::Debug for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("QueueEvent")
        .field("seq", &self.seq)
        .field("os_tid", &self.os_thread)
        .field("task", &self.task.map(|id| id.to_string()).as_deref().unwrap_or("N/A"))
        .field("subject", &self.subject)
        .field("loc", &self.location)
        .field("kind", &self.kind)
        .field("detail", &self.detail.as_deref().unwrap_or(""))
        .finish()
    }
  }

  struct Collector {
    events: Vec<QueueEvent>,
    counters: HashMap<(&'static str, &'static str), usize>,
    started: Instant,
  }

  impl Collector {
    fn new() -> Self {
      Collector {
        events: Vec::new(),
        counters: HashMap::new(),
        started: Instant::now(),
      }
    }
  }

  lazy_static::lazy_static! {
    static ref COLLECTOR: Mutex<Collector> = Mutex::new(Collector::new());
  }

  pub fn log_event_fn(
    subject: Option<usize>,
    location: &'static str,
    kind: &'static str,
    detail: Option<String>,
  ) {
    let event = QueueEvent {
      seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
      at: Instant::now(),
      os_thread: thread::current().id(),
      task: tokio::task::try_id(),
      subject,
      location,
      kind,
      detail,
    };

    match COLLECTOR.lock() {
      Ok(mut collector) => collector.events.push(event),
      Err(_) => eprintln!("[fibre_queue:telemetry] collector mutex poisoned while recording event"),
    }
  }

  pub fn increment_counter_fn(location: &'static str, counter: &'static str) {
    match COLLECTOR.lock() {
      Ok(mut collector) => *collector.counters.entry((location, counter)).or_insert(0) += 1,
      Err(_) => eprintln!("[fibre_queue:telemetry] collector mutex poisoned while incrementing counter"),
    }
  }

  /// Returns the current value of a counter, `0` if it was never incremented.
  pub fn counter_value_fn(location: &'static str, counter: &'static str) -> usize {
    COLLECTOR
      .lock()
      .map(|c| c.counters.get(&(location, counter)).copied().unwrap_or(0))
      .unwrap_or(0)
  }

  /// Returns a copy of every recorded event, ordered by sequence number.
  pub fn events_fn() -> Vec<QueueEvent> {
    let mut events = COLLECTOR.lock().map(|c| c.events.clone()).unwrap_or_default();
    events.sort_by_key(|e| e.seq);
    events
  }

  pub fn print_telemetry_report_fn() {
    let Ok(collector) = COLLECTOR.lock() else {
      eprintln!("[fibre_queue:telemetry] collector mutex poisoned, cannot print report");
      return;
    };

    println!("\n--- fibre_queue telemetry ---");
    let mut events = collector.events.clone();
    events.sort_by_key(|e| e.seq);
    println!("[Events] {}", events.len());
    for event in &events {
      let offset = event.at.duration_since(collector.started);
      println!(
        "  +{:<10.6}s #{:<6} {:?} task:{:<6} subject:{:<6} {:<28} {:<22} {}",
        offset.as_secs_f64(),
        event.seq,
        event.os_thread,
        event.task.map(|id| id.to_string()).unwrap_or_else(|| "---".to_string()),
        event.subject.map_or_else(|| "-".to_string(), |s| s.to_string()),
        event.location,
        event.kind,
        event.detail.as_deref().unwrap_or("")
      );
    }

    let mut counters: Vec<_> = collector.counters.iter().collect();
    counters.sort_by_key(|(k, _)| *k);
    println!("[Counters] {}", counters.len());
    for ((loc, name), value) in counters {
      println!("  {:<28} {:<22} {}", loc, name, value);
    }
    println!("--- end of telemetry ---");
  }

  pub fn clear_telemetry_fn() {
    if let Ok(mut collector) = COLLECTOR.lock() {
      collector.events.clear();
      collector.counters.clear();
      collector.started = Instant::now();
    }
    NEXT_SEQ.store(0, Ordering::Relaxed);
  }
}

#[cfg(not(feature = "queue_telemetry"))]
pub mod disabled {
  #[inline(always)]
  pub fn log_event_fn(
    _subject: Option<usize>,
    _location: &'static str,
    _kind: &'static str,
    _detail: Option<String>,
  ) {
  }
  #[inline(always)]
  pub fn increment_counter_fn(_location: &'static str, _counter: &'static str) {}
  #[inline(always)]
  pub fn print_telemetry_report_fn() {}
  #[inline(always)]
  pub fn clear_telemetry_fn() {}
}

#[cfg(feature = "queue_telemetry")]
pub use enabled::{
  clear_telemetry_fn as clear_telemetry, counter_value_fn as counter_value, events_fn as events,
  increment_counter_fn as increment_counter, log_event_fn as log_event,
  print_telemetry_report_fn as print_telemetry_report, QueueEvent,
};

#[cfg(not(feature = "queue_telemetry"))]
pub use disabled::{
  clear_telemetry_fn as clear_telemetry, increment_counter_fn as increment_counter,
  log_event_fn as log_event, print_telemetry_report_fn as print_telemetry_report,
};
