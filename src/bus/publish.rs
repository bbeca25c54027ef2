//! Outbound fire-and-forget paths: publish (PUB, two-frame topic envelope)
//! and push (PUSH, single-frame stream envelope). Identical contract, only
//! the socket pattern and deadline differ.

use bytes::Bytes;
use tokio::time::timeout;
use zeromq::ZmqMessage;

use crate::codec::{event_envelope, stream_envelope, Payload};
use crate::metrics::bump;
use crate::registry::{Acquire, SocketPattern};

use super::MessageBus;

impl MessageBus {
  /// Publishes `data` on `topic`. The socket binds lazily on first use; while
  /// it is failed or cooling down the message is counted as dropped and the
  /// call returns normally. Transport and timeout failures never surface.
  pub async fn publish(&self, topic: &str, data: Payload, port: u16) {
    let envelope = event_envelope(topic, &self.inner.name, data);
    let deadline = self.inner.config.pub_send_timeout;
    self
      .send_bounded(SocketPattern::Pub, port, Some(topic), envelope, deadline)
      .await;
  }

  /// Pushes a task result onto the work queue on `port`. Same contract as
  /// [`MessageBus::publish`].
  pub async fn push_result(&self, data: Payload, port: u16) {
    let envelope = stream_envelope(&self.inner.name, data);
    let deadline = self.inner.config.push_send_timeout;
    self
      .send_bounded(SocketPattern::Push, port, None, envelope, deadline)
      .await;
  }

  async fn send_bounded(
    &self,
    pattern: SocketPattern,
    port: u16,
    topic: Option<&str>,
    envelope: Payload,
    deadline: std::time::Duration,
  ) {
    let counters = &self.inner.counters;
    let entry = match self.inner.registry.acquire(pattern, port, &[]).await {
      Ok(Acquire::Ready(entry)) => entry,
      Ok(Acquire::Unavailable) => {
        bump(&counters.outbound_dropped);
        tracing::trace!(pattern = pattern.name(), port, "socket unavailable; message dropped");
        return;
      }
      // Construction failed; the registry already counted and cooled it
      // down. Senders retry lazily after the cooldown.
      Err(_) => {
        bump(&counters.outbound_dropped);
        return;
      }
    };

    let encoded = match self.inner.serializer.encode(&envelope) {
      Ok(bytes) => bytes,
      Err(e) => {
        bump(&counters.errors);
        tracing::warn!(pattern = pattern.name(), port, error = %e, "payload encode failed");
        return;
      }
    };
    let msg = match topic {
      Some(topic) => {
        let mut msg = ZmqMessage::from(Bytes::copy_from_slice(topic.as_bytes()));
        msg.push_back(Bytes::from(encoded));
        msg
      }
      None => ZmqMessage::from(Bytes::from(encoded)),
    };

    let mut socket = entry.socket.lock().await;
    match timeout(deadline, socket.send(msg)).await {
      Ok(Ok(())) => {
        bump(&counters.messages_sent);
        tracing::trace!(pattern = pattern.name(), port, "message sent");
      }
      Err(_) => {
        bump(&counters.backpressure_events);
        bump(&counters.outbound_dropped);
        drop(socket);
        self.inner.registry.fail(entry.key);
        tracing::warn!(
          pattern = pattern.name(),
          port,
          ?deadline,
          "send deadline hit; socket failed"
        );
      }
      Ok(Err(e)) => {
        bump(&counters.errors);
        bump(&counters.outbound_dropped);
        drop(socket);
        self.inner.registry.fail(entry.key);
        tracing::warn!(pattern = pattern.name(), port, error = %e, "send failed; socket failed");
      }
    }
  }
}
