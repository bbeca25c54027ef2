use std::time::Duration;

use thiserror::Error;

/// Failure raised while encoding an outbound payload.
///
/// Calling paths translate this into dropped-message counters; it only
/// surfaces directly from [`Serializer::encode`](crate::codec::Serializer::encode).
#[derive(Error, Debug)]
#[error("encode failed ({codec}): {reason}")]
pub struct EncodeError {
  /// Short name of the codec that rejected the payload.
  pub codec: &'static str,
  pub reason: String,
}

/// Failure raised while decoding an inbound frame.
#[derive(Error, Debug)]
#[error("decode failed ({codec}): {reason}")]
pub struct DecodeError {
  pub codec: &'static str,
  pub reason: String,
}

/// Errors produced by the message bus.
///
/// User-visible send operations (`publish`, `push_result`, `request`) never
/// return transport or timeout variants; those are recorded in metrics and the
/// operation returns normally. The long-lived loops surface only bind-time
/// failures and misuse.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BusError {
  #[error("transport error: {0}")]
  Transport(#[from] zeromq::ZmqError),

  #[error("operation timed out after {0:?}")]
  Timeout(Duration),

  #[error(transparent)]
  Encode(#[from] EncodeError),

  #[error(transparent)]
  Decode(#[from] DecodeError),

  /// A bind-role socket (PUB, PULL, REP) could not bind its port.
  #[error("bind failed on port {port}: {reason}")]
  Bind { port: u16, reason: String },

  /// A user handler returned an error.
  #[error("handler failed: {0}")]
  Handler(String),

  /// The bus has been cleaned up; no further socket activity is possible.
  #[error("message bus is shut down")]
  Closed,
}

impl BusError {
  /// Short stable label for logs and error envelopes.
  pub fn label(&self) -> &'static str {
    match self {
      BusError::Transport(_) => "transport",
      BusError::Timeout(_) => "timeout",
      BusError::Encode(_) => "encode",
      BusError::Decode(_) => "decode",
      BusError::Bind { .. } => "bind",
      BusError::Handler(_) => "handler",
      BusError::Closed => "closed",
    }
  }
}
