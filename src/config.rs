//! Bus configuration.
//!
//! Every knob is optional in the sense that [`BusConfig::default`] carries
//! working values; deployments override the fields they care about before
//! constructing the bus.

use std::time::Duration;

use tracing::Level;

use crate::codec::SerializerKind;

/// Tunables governing socket options, deadlines, and the dispatch path.
#[derive(Debug, Clone)]
pub struct BusConfig {
  /// Send-side high-water mark recorded on every constructed socket.
  pub hwm_outbound: u32,
  /// Receive-side high-water mark recorded on every constructed socket.
  pub hwm_inbound: u32,
  /// Deadline for a single publish send.
  pub pub_send_timeout: Duration,
  /// Deadline for a single push send.
  pub push_send_timeout: Duration,
  /// Total request deadline; halved into the send and receive phases.
  pub req_total_timeout: Duration,
  /// Response-loop receive deadline per poll.
  pub rep_recv_timeout: Duration,
  /// Response-loop reply-send deadline.
  pub rep_send_timeout: Duration,
  /// How long a failed socket entry stays unusable before the next access
  /// rebuilds it.
  pub failed_socket_cooldown: Duration,
  /// Cap on concurrently executing subscriber handlers; `None` = unlimited.
  pub handler_max_concurrency: Option<usize>,
  /// Level used to log a subscribed message whose topic has no handler.
  pub log_level_no_handler: Level,
  /// Wire codec; both sides of a link must agree.
  pub serializer: SerializerKind,
  /// Grace before a retired socket is finally dropped, letting in-flight
  /// writes flush.
  pub close_linger: Duration,
}

impl Default for BusConfig {
  fn default() -> Self {
    Self {
      hwm_outbound: 1000,
      hwm_inbound: 1000,
      pub_send_timeout: Duration::from_secs(1),
      push_send_timeout: Duration::from_secs(1),
      req_total_timeout: Duration::from_secs(5),
      rep_recv_timeout: Duration::from_secs(30),
      rep_send_timeout: Duration::from_secs(5),
      failed_socket_cooldown: Duration::from_secs(10),
      handler_max_concurrency: None,
      log_level_no_handler: Level::DEBUG,
      serializer: SerializerKind::Json,
      close_linger: Duration::from_millis(100),
    }
  }
}
