//! tickbus - asynchronous messaging middleware for a distributed
//! quant-trading runtime, built on a pure-Rust ZeroMQ transport and Tokio.
//!
//! One [`MessageBus`] per service multiplexes three communication patterns
//! over a single socket family:
//!
//! - event broadcast (PUB/SUB) via [`MessageBus::publish`] and
//!   [`MessageBus::subscribe_loop`],
//! - work-queue streaming (PUSH/PULL) via [`MessageBus::push_result`] and
//!   [`MessageBus::pull_results_loop`],
//! - synchronous queries (REQ/REP) via [`MessageBus::request`] and
//!   [`MessageBus::response_loop`].
//!
//! The bus is built for predictable degradation under load rather than
//! guaranteed delivery: every send runs under a bounded deadline, a failing
//! socket is cooled down and rebuilt instead of retried hot, subscriber
//! dispatch can be capped by a concurrency gate, and every drop is recorded
//! in monotonic counters surfaced by [`MessageBus::get_metrics`].

pub mod bus;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod metrics;

mod registry;

pub use bus::MessageBus;
pub use codec::{Payload, Serializer, SerializerKind};
pub use config::BusConfig;
pub use error::{BusError, DecodeError, EncodeError};
pub use handler::{
  Handler, HandlerResult, LoggingPullConsumer, NotImplementedResponder, PullConsumer, Responder,
};
pub use metrics::MetricsSnapshot;
