//! Synchronous query path over REQ sockets.
//!
//! The REQ state machine mandates strict send-then-receive alternation, so a
//! per-port mutex serializes the full exchange and any mid-cycle failure,
//! timeout, or cancellation poisons the socket: it is failed-marked and
//! rebuilt after the cooldown rather than resynchronized.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::timeout;
use zeromq::ZmqMessage;

use crate::codec::{stream_envelope, Payload};
use crate::metrics::bump;
use crate::registry::{Acquire, SocketKey, SocketPattern};

use super::{BusInner, MessageBus};

/// Fails the REQ entry unless the exchange completed. Runs on drop, which
/// also covers the caller cancelling mid-cycle.
struct PoisonGuard {
  inner: Arc<BusInner>,
  key: SocketKey,
  armed: bool,
}

impl PoisonGuard {
  fn new(inner: &Arc<BusInner>, key: SocketKey) -> Self {
    Self {
      inner: Arc::clone(inner),
      key,
      armed: true,
    }
  }

  fn disarm(&mut self) {
    self.armed = false;
  }
}

impl Drop for PoisonGuard {
  fn drop(&mut self) {
    if self.armed {
      self.inner.registry.fail(self.key);
    }
  }
}

impl MessageBus {
  /// Sends `data` to the responder on `port` and waits for the reply.
  ///
  /// The total deadline is split evenly between the send and receive phases.
  /// Returns `None` on any failure: encode error, transport error, phase
  /// timeout, or a socket still cooling down from an earlier failure. Every
  /// failure is recorded in metrics, never raised. Request/reply traffic does
  /// not count in `messages_sent`/`messages_received`.
  pub async fn request(&self, data: Payload, port: u16) -> Option<Payload> {
    let counters = &self.inner.counters;
    let lock = self.request_lock(port);
    let _serial = lock.lock().await;

    let entry = match self
      .inner
      .registry
      .acquire(SocketPattern::Req, port, &[])
      .await
    {
      Ok(Acquire::Ready(entry)) => entry,
      Ok(Acquire::Unavailable) => {
        bump(&counters.outbound_dropped);
        tracing::debug!(port, "request skipped; socket cooling down");
        return None;
      }
      // Connect failure, already counted and cooled down by the registry.
      Err(_) => return None,
    };

    let envelope = stream_envelope(&self.inner.name, data);
    let encoded = match self.inner.serializer.encode(&envelope) {
      Ok(bytes) => bytes,
      Err(e) => {
        bump(&counters.errors);
        tracing::warn!(port, error = %e, "request encode failed");
        return None;
      }
    };

    let phase = self.inner.config.req_total_timeout / 2;
    let mut guard = PoisonGuard::new(&self.inner, entry.key);
    let mut socket = entry.socket.lock().await;

    match timeout(phase, socket.send(ZmqMessage::from(Bytes::from(encoded)))).await {
      Ok(Ok(())) => {}
      Ok(Err(e)) => {
        bump(&counters.errors);
        tracing::warn!(port, error = %e, "request send failed");
        return None;
      }
      Err(_) => {
        bump(&counters.request_timeouts);
        tracing::warn!(port, ?phase, "request send timed out");
        return None;
      }
    }

    let reply = match timeout(phase, socket.recv()).await {
      Ok(Ok(reply)) => reply,
      Ok(Err(e)) => {
        bump(&counters.errors);
        tracing::warn!(port, error = %e, "request receive failed");
        return None;
      }
      Err(_) => {
        bump(&counters.request_timeouts);
        tracing::warn!(port, ?phase, "request timed out waiting for reply");
        return None;
      }
    };
    drop(socket);
    guard.disarm();

    let frame = match reply.get(0) {
      Some(frame) => frame,
      None => {
        bump(&counters.inbound_dropped);
        return None;
      }
    };
    match self.inner.serializer.decode(frame) {
      Ok(payload) => Some(payload),
      Err(e) => {
        bump(&counters.inbound_dropped);
        tracing::warn!(port, error = %e, "reply decode failed");
        None
      }
    }
  }

  fn request_lock(&self, port: u16) -> Arc<tokio::sync::Mutex<()>> {
    self
      .inner
      .request_locks
      .lock()
      .entry(port)
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }
}
