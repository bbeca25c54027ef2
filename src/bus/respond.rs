//! Responder side of the synchronous query pattern.
//!
//! The REP state machine requires exactly one reply per received request, so
//! every inbound frame is answered: a responder failure, panic, or an
//! undecodable request all produce an error envelope instead of a skipped
//! send. Only a transport failure tears the socket down, and then the loop
//! rebinds after one cooldown with a fresh state machine.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio::time::timeout;
use zeromq::ZmqMessage;

use crate::codec::error_envelope;
use crate::error::BusError;
use crate::handler::Responder;
use crate::metrics::bump;
use crate::registry::{Acquire, SocketPattern};

use super::{LoopGuard, MessageBus};

impl MessageBus {
  /// Runs the response loop for `port`, answering each request through
  /// `responder`. Launch it as a background task.
  ///
  /// REP binds, so a port conflict surfaces as [`BusError::Bind`].
  pub async fn response_loop(
    &self,
    port: u16,
    responder: Arc<dyn Responder>,
  ) -> Result<(), BusError> {
    if self.inner.shutdown_started.load(Ordering::Acquire) {
      return Err(BusError::Closed);
    }
    let _guard = LoopGuard::new(&self.inner);
    let token = self.inner.loop_token.clone();
    let counters = &self.inner.counters;
    let mut bound_once = false;
    tracing::info!(service = %self.inner.name, port, "response loop started");

    while !token.is_cancelled() {
      let entry = match self
        .inner
        .registry
        .acquire(SocketPattern::Rep, port, &[])
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
          tracing::info!(service = %self.inner.name, port, "response loop stopped on bind failure");
          return Err(e);
        }
        Err(_) => {
          self.pause_for_cooldown(&token).await;
          continue;
        }
      };
      bound_once = true;

      'serve: loop {
        let mut socket = entry.socket.lock().await;
        let polled = tokio::select! {
          _ = token.cancelled() => {
            tracing::info!(service = %self.inner.name, port, "response loop stopped");
            return Ok(());
          }
          polled = timeout(self.inner.config.rep_recv_timeout, socket.recv()) => polled,
        };
        let msg = match polled {
          Err(_) => continue 'serve,
          Ok(Err(e)) => {
            bump(&counters.errors);
            drop(socket);
            self.inner.registry.fail(entry.key);
            tracing::warn!(port, error = %e, "responder receive failed; rebinding after cooldown");
            break 'serve;
          }
          Ok(Ok(msg)) => msg,
        };

        // From here on exactly one reply must go out before the next recv.
        let reply = match msg.get(0).map(|frame| self.inner.serializer.decode(frame)) {
          Some(Ok(request)) => {
            match AssertUnwindSafe(responder.handle_request(request))
              .catch_unwind()
              .await
            {
              Ok(Ok(reply)) => reply,
              Ok(Err(e)) => {
                bump(&counters.errors);
                tracing::warn!(port, error = %e, "responder failed; sending error envelope");
                error_envelope(&e.to_string())
              }
              Err(_panic) => {
                bump(&counters.errors);
                tracing::warn!(port, "responder panicked; sending error envelope");
                error_envelope("handler panicked")
              }
            }
          }
          _ => {
            bump(&counters.inbound_dropped);
            tracing::debug!(port, "request decode failed; sending error envelope");
            error_envelope("request decode failed")
          }
        };

        let encoded = match self.inner.serializer.encode(&reply) {
          Ok(bytes) => bytes,
          Err(e) => {
            bump(&counters.errors);
            tracing::warn!(port, error = %e, "reply encode failed; sending error envelope");
            match self.inner.serializer.encode(&error_envelope("reply encode failed")) {
              Ok(bytes) => bytes,
              // No reply can be produced at all; the state machine is
              // unrecoverable, tear the socket down.
              Err(_) => {
                drop(socket);
                self.inner.registry.fail(entry.key);
                break 'serve;
              }
            }
          }
        };

        match timeout(
          self.inner.config.rep_send_timeout,
          socket.send(ZmqMessage::from(Bytes::from(encoded))),
        )
        .await
        {
          Ok(Ok(())) => {}
          Ok(Err(e)) => {
            bump(&counters.errors);
            drop(socket);
            self.inner.registry.fail(entry.key);
            tracing::warn!(port, error = %e, "reply send failed; rebinding after cooldown");
            break 'serve;
          }
          Err(_) => {
            bump(&counters.errors);
            drop(socket);
            self.inner.registry.fail(entry.key);
            tracing::warn!(port, "reply send timed out; rebinding after cooldown");
            break 'serve;
          }
        }
      }
    }

    tracing::info!(service = %self.inner.name, port, "response loop stopped");
    Ok(())
  }
}
