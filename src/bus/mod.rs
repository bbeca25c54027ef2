//! The message bus: a family of pattern sockets bound to configured ports,
//! the dispatch machinery that fans subscribed messages out to handlers, and
//! the lifecycle that tears all of it down.

mod publish;
mod pull;
mod request;
mod respond;
mod subscribe;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::Serializer;
use crate::config::BusConfig;
use crate::handler::Handler;
use crate::metrics::{Counters, MetricsSnapshot};
use crate::registry::SocketRegistry;

/// Poll deadline for the subscribe and pull receive loops; short enough that
/// cancellation is observed promptly.
pub(crate) const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How long `cleanup(cancel_running = true)` waits for dispatched handler
/// tasks before abandoning blocking stragglers.
const DISPATCH_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Unified interface over the runtime's three messaging patterns: event
/// broadcast (PUB/SUB), work-queue streaming (PUSH/PULL), and synchronous
/// queries (REQ/REP).
///
/// A bus owns its transport sockets exclusively; instances are freely
/// constructible and independent. Cloning is cheap and every clone drives the
/// same underlying bus, which is how the long-lived loops are launched:
///
/// ```no_run
/// use tickbus::{constants::ports, BusConfig, MessageBus};
///
/// # async fn demo() {
/// let bus = MessageBus::new("scheduler", BusConfig::default());
/// let sub = bus.clone();
/// tokio::spawn(async move { sub.subscribe_loop(ports::GLOBAL_EVENTS, &["GLOBAL_STEP"]).await });
/// # }
/// ```
#[derive(Clone)]
pub struct MessageBus {
  pub(crate) inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
  pub name: String,
  pub config: BusConfig,
  pub serializer: Serializer,
  pub registry: SocketRegistry,
  pub handlers: Mutex<HashMap<String, Handler>>,
  pub request_locks: Mutex<HashMap<u16, Arc<tokio::sync::Mutex<()>>>>,
  pub counters: Arc<Counters>,
  /// Optional cap on concurrently executing subscriber handlers.
  pub dispatch_gate: Option<Arc<Semaphore>>,
  /// In-flight dispatched handler tasks, joined at cleanup.
  pub tracker: TaskTracker,
  /// Cancels the long-lived receive loops.
  pub loop_token: CancellationToken,
  /// Cancels in-flight handler tasks when cleanup runs with
  /// `cancel_running = true`.
  pub handler_token: CancellationToken,
  pub active_loops: AtomicUsize,
  pub loops_idle: Notify,
  pub shutdown_started: AtomicBool,
}

impl MessageBus {
  /// Creates a bus for the named service. The name is stamped into every
  /// outbound envelope as `sender`.
  pub fn new(service_name: impl Into<String>, config: BusConfig) -> Self {
    let name = service_name.into();
    let counters = Arc::new(Counters::default());
    let registry = SocketRegistry::new(&config, Arc::clone(&counters));
    let dispatch_gate = config
      .handler_max_concurrency
      .map(|cap| Arc::new(Semaphore::new(cap)));
    let serializer = Serializer::new(config.serializer);
    tracing::debug!(service = %name, codec = ?serializer.kind(), "message bus created");
    Self {
      inner: Arc::new(BusInner {
        name,
        config,
        serializer,
        registry,
        handlers: Mutex::new(HashMap::new()),
        request_locks: Mutex::new(HashMap::new()),
        counters,
        dispatch_gate,
        tracker: TaskTracker::new(),
        loop_token: CancellationToken::new(),
        handler_token: CancellationToken::new(),
        active_loops: AtomicUsize::new(0),
        loops_idle: Notify::new(),
        shutdown_started: AtomicBool::new(false),
      }),
    }
  }

  pub fn service_name(&self) -> &str {
    &self.inner.name
  }

  /// Registers `handler` for `topic`, atomically replacing any prior binding.
  /// Messages already dispatched to the old handler run to completion.
  pub fn register_handler(&self, topic: impl Into<String>, handler: Handler) {
    let topic = topic.into();
    tracing::debug!(service = %self.inner.name, %topic, kind = handler.kind(), "handler registered");
    self.inner.handlers.lock().insert(topic, handler);
  }

  /// Snapshot of the bus counters plus the healthy-socket gauge.
  pub fn get_metrics(&self) -> MetricsSnapshot {
    self
      .inner
      .counters
      .snapshot(self.inner.registry.healthy_count())
  }

  /// Shuts the bus down: cancels every receive loop, waits for them to exit,
  /// drains dispatched handler tasks, then closes the socket family with the
  /// configured linger. Returns only once all of that has happened.
  ///
  /// With `cancel_running = true` (the usual choice) in-flight handler tasks
  /// are cancelled; cooperative handlers stop at their next await point, and
  /// blocking handlers that outlive a bounded grace are abandoned on the
  /// worker pool. With `false` they are awaited to natural completion.
  pub async fn cleanup(&self, cancel_running: bool) {
    let first = !self.inner.shutdown_started.swap(true, Ordering::AcqRel);
    if first {
      tracing::info!(service = %self.inner.name, cancel_running, "message bus shutting down");
    }
    self.inner.loop_token.cancel();
    self.wait_for_loops().await;

    self.inner.tracker.close();
    if cancel_running {
      self.inner.handler_token.cancel();
      if timeout(DISPATCH_DRAIN_GRACE, self.inner.tracker.wait())
        .await
        .is_err()
      {
        tracing::warn!(
          service = %self.inner.name,
          "blocking handlers still running after drain grace; abandoning"
        );
      }
    } else {
      self.inner.tracker.wait().await;
    }

    self.inner.registry.close_all().await;
    if first {
      tracing::info!(service = %self.inner.name, "message bus closed");
    }
  }

  async fn wait_for_loops(&self) {
    loop {
      if self.inner.active_loops.load(Ordering::Acquire) == 0 {
        return;
      }
      tokio::select! {
        _ = self.inner.loops_idle.notified() => {}
        // Re-check periodically in case a notification raced the counter.
        _ = sleep(Duration::from_millis(50)) => {}
      }
    }
  }
}

/// Registers a running receive loop for the lifetime of its guard; cleanup
/// waits until every guard has dropped.
pub(crate) struct LoopGuard {
  inner: Arc<BusInner>,
}

impl LoopGuard {
  pub fn new(inner: &Arc<BusInner>) -> Self {
    inner.active_loops.fetch_add(1, Ordering::AcqRel);
    Self {
      inner: Arc::clone(inner),
    }
  }
}

impl Drop for LoopGuard {
  fn drop(&mut self) {
    if self.inner.active_loops.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.inner.loops_idle.notify_waiters();
    }
  }
}
