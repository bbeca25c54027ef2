//! Monotonic counters for bus observability.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Internal counter bundle. Counters only ever increase; `active_connections`
/// is derived from the socket registry at snapshot time.
#[derive(Debug, Default)]
pub(crate) struct Counters {
  pub messages_sent: AtomicU64,
  pub messages_received: AtomicU64,
  pub errors: AtomicU64,
  pub outbound_dropped: AtomicU64,
  pub inbound_dropped: AtomicU64,
  pub backpressure_events: AtomicU64,
  pub request_timeouts: AtomicU64,
  pub failed_bind_count: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
  counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
  pub fn snapshot(&self, active_connections: usize) -> MetricsSnapshot {
    MetricsSnapshot {
      messages_sent: self.messages_sent.load(Ordering::Relaxed),
      messages_received: self.messages_received.load(Ordering::Relaxed),
      errors: self.errors.load(Ordering::Relaxed),
      outbound_dropped: self.outbound_dropped.load(Ordering::Relaxed),
      inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
      backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
      request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
      failed_bind_count: self.failed_bind_count.load(Ordering::Relaxed),
      active_connections,
    }
  }
}

/// Point-in-time view of the bus counters.
///
/// `messages_sent`/`messages_received` cover the publish, push, subscribe, and
/// pull paths; request/reply traffic is tracked through `request_timeouts` and
/// the drop counters instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub messages_sent: u64,
  pub messages_received: u64,
  pub errors: u64,
  pub outbound_dropped: u64,
  pub inbound_dropped: u64,
  pub backpressure_events: u64,
  pub request_timeouts: u64,
  pub failed_bind_count: u64,
  /// Count of healthy socket entries; failed entries in cooldown are excluded.
  pub active_connections: usize,
}
