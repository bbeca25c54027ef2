//! Pull side of the work-queue pattern. Single-frame envelopes, delivered to
//! one [`PullConsumer`] hook in receive order; the transport's own queueing
//! is the backpressure here, so no concurrency gate applies.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::timeout;

use crate::error::BusError;
use crate::handler::PullConsumer;
use crate::metrics::bump;
use crate::registry::{Acquire, SocketPattern};

use super::{LoopGuard, MessageBus, RECV_POLL_TIMEOUT};

impl MessageBus {
  /// Runs the pull loop for `port`, invoking `consumer` for every decoded
  /// message. Launch it as a background task.
  ///
  /// PULL binds, so a port conflict surfaces as [`BusError::Bind`] to the
  /// caller. Transport receive errors fail the socket and the loop rebinds
  /// after one cooldown.
  pub async fn pull_results_loop(
    &self,
    port: u16,
    consumer: Arc<dyn PullConsumer>,
  ) -> Result<(), BusError> {
    if self.inner.shutdown_started.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    let _guard = LoopGuard::new(&self.inner);
    let token = self.inner.loop_token.clone();
    let counters = &self.inner.counters;
    let mut bound_once = false;
    tracing::info!(service = %self.inner.name, port, "pull loop started");

    while !token.is_cancelled() {
      let entry = match self
        .inner
        .registry
        .acquire(SocketPattern::Pull, port, &[])
        .await
      {
        Ok(Acquire::Ready(entry)) => entry,
        Ok(Acquire::Unavailable) => {
          self.pause_for_cooldown(&token).await;
          continue;
        }
        // The initial bind failure surfaces to the caller; a rebind after a
        // mid-run failure retries, since the old listener may still be
        // releasing the port.
        Err(e @ BusError::Bind { .. }) if !bound_once => {
          tracing::info!(service = %self.inner.name, port, "pull loop stopped on bind failure");
          return Err(e);
        }
        Err(_) => {
          self.pause_for_cooldown(&token).await;
          continue;
        }
      };
      bound_once = true;

      loop {
        let polled = {
          let mut socket = entry.socket.lock().await;
          tokio::select! {
            _ = token.cancelled() => {
              tracing::info!(service = %self.inner.name, port, "pull loop stopped");
              return Ok(());
            }
            polled = timeout(RECV_POLL_TIMEOUT, socket.recv()) => polled,
          }
        };
        let msg = match polled {
          Err(_) => continue,
          Ok(Err(e)) => {
            bump(&counters.errors);
            self.inner.registry.fail(entry.key);
            tracing::warn!(port, error = %e, "pull receive failed; rebinding after cooldown");
            break;
          }
          Ok(Ok(msg)) => msg,
        };

        let payload = match msg.get(0) {
          Some(frame) => match self.inner.serializer.decode(frame) {
            Ok(payload) => payload,
            Err(e) => {
              bump(&counters.inbound_dropped);
              tracing::debug!(port, error = %e, "pulled payload decode failed");
              continue;
            }
          },
          None => {
            bump(&counters.inbound_dropped);
            continue;
          }
        };
        bump(&counters.messages_received);
        if AssertUnwindSafe(consumer.handle_result(payload))
          .catch_unwind()
          .await
          .is_err()
        {
          bump(&counters.errors);
          tracing::warn!(port, "pull consumer panicked");
        }
      }
    }

    tracing::info!(service = %self.inner.name, port, "pull loop stopped");
    Ok(())
  }
}
