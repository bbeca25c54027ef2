//! Well-known ports and topic strings shared by the runtime's services.
//!
//! Ports are conventions, not requirements: every bus operation takes an
//! explicit port, and deployments may remap them freely as long as both sides
//! of a link agree.

/// Default port assignments per messaging pattern.
pub mod ports {
  /// PUB/SUB: global step events, reflection updates, service control.
  pub const GLOBAL_EVENTS: u16 = 5555;
  /// PUSH/PULL: task result collection.
  pub const TASK_RESULTS: u16 = 5556;
  /// REQ/REP: state read/write requests.
  pub const STATE_MANAGEMENT: u16 = 5557;
}

/// Conventional pub/sub topic strings.
pub mod topics {
  pub const GLOBAL_STEP: &str = "GLOBAL_STEP";
  pub const MARKET_DATA: &str = "MARKET_DATA";
  pub const REFLECTION_UPDATE: &str = "REFLECTION_UPDATE";
  /// Data-driven step events in backtest mode.
  pub const DATA_PROCESSED: &str = "DATA_PROCESSED";
  pub const TASK_RESULTS: &str = "TASK_RESULTS";
  pub const SERVICE_START: &str = "SERVICE_START";
  pub const SERVICE_STOP: &str = "SERVICE_STOP";
}
