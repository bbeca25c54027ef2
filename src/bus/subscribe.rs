//! Subscriber side of the event broadcast pattern: receive two-frame
//! envelopes, decode, look up the topic handler, and dispatch under the
//! optional concurrency gate.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use zeromq::ZmqMessage;

use crate::codec::Payload;
use crate::error::BusError;
use crate::handler::Handler;
use crate::metrics::bump;
use crate::registry::{Acquire, SocketEntry, SocketPattern};

use super::{LoopGuard, MessageBus, RECV_POLL_TIMEOUT};

impl MessageBus {
  /// Runs the subscriber loop for `port`, filtering on the given topic
  /// prefixes (empty slice = subscribe-all). Launch it as a background task;
  /// it runs until [`MessageBus::cleanup`](super::MessageBus::cleanup) cancels it.
  ///
  /// A bad frame or undecodable payload is counted and skipped. A transport
  /// error fails the socket; the loop sleeps one cooldown and rebuilds, with
  /// the subscriptions reapplied. Connect failures are retried the same way,
  /// so the loop may be started before the publisher exists.
  pub async fn subscribe_loop(&self, port: u16, topics: &[&str]) -> Result<(), BusError> {
    if self.inner.shutdown_started.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
    let _guard = LoopGuard::new(&self.inner);
    let token = self.inner.loop_token.clone();
    tracing::info!(service = %self.inner.name, port, ?topics, "subscribe loop started");

    while !token.is_cancelled() {
      let entry = match self
        .inner
        .registry
        .acquire(SocketPattern::Sub, port, &topics)
        .await
      {
        Ok(Acquire::Ready(entry)) => entry,
        Ok(Acquire::Unavailable) | Err(_) => {
          self.pause_for_cooldown(&token).await;
          continue;
        }
      };
      self.drive_subscriber(port, &entry, &token).await;
    }

    tracing::info!(service = %self.inner.name, port, "subscribe loop stopped");
    Ok(())
  }

  /// Receives on one subscriber entry until cancellation or a transport
  /// error fails it.
  async fn drive_subscriber(
    &self,
    port: u16,
    entry: &Arc<SocketEntry>,
    token: &CancellationToken,
  ) {
    let counters = &self.inner.counters;
    loop {
      let polled = {
        let mut socket = entry.socket.lock().await;
        tokio::select! {
          _ = token.cancelled() => return,
          polled = timeout(RECV_POLL_TIMEOUT, socket.recv()) => polled,
        }
      };
      match polled {
        Err(_) => continue,
        Ok(Err(e)) => {
          bump(&counters.errors);
          self.inner.registry.fail(entry.key);
          tracing::warn!(port, error = %e, "subscriber receive failed; rebuilding after cooldown");
          return;
        }
        Ok(Ok(msg)) => self.dispatch_subscription(port, msg, token).await,
      }
    }
  }

  async fn dispatch_subscription(&self, port: u16, msg: ZmqMessage, token: &CancellationToken) {
    let counters = &self.inner.counters;
    if msg.len() != 2 {
      bump(&counters.inbound_dropped);
      tracing::debug!(port, frames = msg.len(), "unexpected frame count");
      return;
    }
    let topic = match msg.get(0).map(|frame| std::str::from_utf8(frame)) {
      Some(Ok(topic)) => topic.to_string(),
      _ => {
        bump(&counters.inbound_dropped);
        tracing::debug!(port, "topic frame is not UTF-8");
        return;
      }
    };
    let payload = match msg.get(1) {
      Some(frame) => match self.inner.serializer.decode(frame) {
        Ok(payload) => payload,
        Err(e) => {
          bump(&counters.inbound_dropped);
          tracing::debug!(port, %topic, error = %e, "payload decode failed");
          return;
        }
      },
      None => {
        bump(&counters.inbound_dropped);
        return;
      }
    };

    let handler = self.inner.handlers.lock().get(&topic).cloned();
    let Some(handler) = handler else {
      self.log_unhandled(&topic);
      return;
    };

    // Permit acquisition is the designed backpressure point: the receive
    // loop blocks here when the cap is saturated, FIFO in receive order.
    let permit = match &self.inner.dispatch_gate {
      Some(gate) => tokio::select! {
        _ = token.cancelled() => return,
        permit = gate.clone().acquire_owned() => match permit {
          Ok(permit) => Some(permit),
          Err(_) => return,
        },
      },
      None => None,
    };
    self.spawn_handler(topic, handler, payload, permit);
    bump(&counters.messages_received);
  }

  fn spawn_handler(
    &self,
    topic: String,
    handler: Handler,
    payload: Payload,
    permit: Option<OwnedSemaphorePermit>,
  ) {
    let counters = Arc::clone(&self.inner.counters);
    let cancel = self.inner.handler_token.clone();
    self.inner.tracker.spawn(async move {
      // Held for the whole handler run, success or failure.
      let _permit = permit;
      let outcome = match handler {
        Handler::Cooperative(f) => {
          let fut = AssertUnwindSafe(f(payload)).catch_unwind();
          tokio::select! {
            _ = cancel.cancelled() => {
              tracing::trace!(%topic, "handler cancelled");
              return;
            }
            caught = fut => caught,
          }
        }
        Handler::Blocking(f) => {
          let join = tokio::task::spawn_blocking(move || f(payload));
          tokio::select! {
            _ = cancel.cancelled() => {
              // The worker-pool job cannot be interrupted; it finishes on
              // its own after the permit is released.
              tracing::trace!(%topic, "blocking handler abandoned on cancellation");
              return;
            }
            joined = join => match joined {
              Ok(result) => Ok(result),
              Err(join_err) if join_err.is_panic() => Err(join_err.into_panic()),
              Err(_) => Ok(Err(BusError::Handler("blocking task aborted".into()))),
            },
          }
        }
      };
      match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
          bump(&counters.errors);
          tracing::warn!(%topic, error = %e, "handler failed");
        }
        Err(_panic) => {
          bump(&counters.errors);
          tracing::warn!(%topic, "handler panicked");
        }
      }
    });
  }

  fn log_unhandled(&self, topic: &str) {
    let level = self.inner.config.log_level_no_handler;
    // tracing events need a const level, hence the ladder.
    if level == Level::ERROR {
      tracing::error!(topic, "no handler registered for topic");
    } else if level == Level::WARN {
      tracing::warn!(topic, "no handler registered for topic");
    } else if level == Level::INFO {
      tracing::info!(topic, "no handler registered for topic");
    } else if level == Level::DEBUG {
      tracing::debug!(topic, "no handler registered for topic");
    } else {
      tracing::trace!(topic, "no handler registered for topic");
    }
  }

  /// Waits out one cooldown, returning early on cancellation.
  pub(crate) async fn pause_for_cooldown(&self, token: &CancellationToken) {
    tokio::select! {
      _ = token.cancelled() => {}
      _ = sleep(self.inner.config.failed_socket_cooldown) => {}
    }
  }
}
