//! User-registered message consumers.
//!
//! Subscriber handlers come in two declared styles: cooperative handlers run
//! as tasks on the shared scheduler, blocking handlers are shipped to the
//! worker pool so the receive loop never stalls behind them. The pull and
//! response loops use trait hooks instead, since each loop has exactly one
//! consumer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::codec::Payload;
use crate::error::BusError;

/// Result of one handler invocation. Errors are counted and logged by the
/// dispatch path; they never stop the receive loop.
pub type HandlerResult = Result<(), BusError>;

type CooperativeFn = dyn Fn(Payload) -> BoxFuture<'static, HandlerResult> + Send + Sync;
type BlockingFn = dyn Fn(Payload) -> HandlerResult + Send + Sync;

/// A topic handler, declared cooperative or blocking at registration.
#[derive(Clone)]
pub enum Handler {
  Cooperative(Arc<CooperativeFn>),
  Blocking(Arc<BlockingFn>),
}

impl Handler {
  /// Wraps an async handler. It runs on the scheduler and must yield at its
  /// await points; CPU-heavy work belongs in [`Handler::blocking`].
  pub fn cooperative<F, Fut>(f: F) -> Self
  where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
  {
    Handler::Cooperative(Arc::new(move |payload| f(payload).boxed()))
  }

  /// Wraps a synchronous handler; each invocation runs on the worker pool.
  pub fn blocking<F>(f: F) -> Self
  where
    F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
  {
    Handler::Blocking(Arc::new(f))
  }

  pub(crate) fn kind(&self) -> &'static str {
    match self {
      Handler::Cooperative(_) => "cooperative",
      Handler::Blocking(_) => "blocking",
    }
  }
}

impl fmt::Debug for Handler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("Handler").field(&self.kind()).finish()
  }
}

/// Consumer hook for the pull loop; one implementation per loop.
#[async_trait]
pub trait PullConsumer: Send + Sync {
  async fn handle_result(&self, message: Payload);
}

/// Default pull consumer: logs each received result and nothing else.
pub struct LoggingPullConsumer;

#[async_trait]
impl PullConsumer for LoggingPullConsumer {
  async fn handle_result(&self, message: Payload) {
    tracing::info!(%message, "pulled result");
  }
}

/// Request hook for the response loop. A returned error is answered with an
/// error envelope so the REP socket still sends exactly one reply.
#[async_trait]
pub trait Responder: Send + Sync {
  async fn handle_request(&self, request: Payload) -> Result<Payload, BusError>;
}

/// Default responder: acknowledges every request with a `not_implemented`
/// status.
pub struct NotImplementedResponder;

#[async_trait]
impl Responder for NotImplementedResponder {
  async fn handle_request(&self, request: Payload) -> Result<Payload, BusError> {
    tracing::info!(%request, "request received by default responder");
    Ok(serde_json::json!({ "status": "not_implemented" }))
  }
}
