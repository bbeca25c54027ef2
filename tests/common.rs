// tests/common.rs
#![allow(dead_code)] // Not every helper is used by every test binary.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tickbus::{BusConfig, MessageBus};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);
static TRACING_INIT: Once = Once::new();

fn setup_tracing() {
  TRACING_INIT.call_once(|| {
    // Default filter; override with RUST_LOG.
    let default_filter = "tickbus=debug,warn";
    let env_filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = FmtSubscriber::builder()
      .with_env_filter(env_filter)
      .with_target(true)
      .with_test_writer()
      .finish();

    tracing::subscriber::set_global_default(subscriber)
      .expect("failed to set global tracing subscriber");
  });
}

/// Hands out a port unique within this test binary. Each test file passes its
/// own block base so binaries running in parallel never collide.
pub fn unique_port(block: u16) -> u16 {
  block + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

/// Bus config tightened for tests: short cooldowns and deadlines so failure
/// paths run in milliseconds instead of the production defaults.
pub fn test_config() -> BusConfig {
  let mut cfg = BusConfig::default();
  cfg.pub_send_timeout = Duration::from_millis(500);
  cfg.push_send_timeout = Duration::from_millis(500);
  cfg.req_total_timeout = Duration::from_secs(2);
  cfg.rep_recv_timeout = Duration::from_millis(200);
  cfg.rep_send_timeout = Duration::from_millis(500);
  cfg.failed_socket_cooldown = Duration::from_millis(300);
  cfg.close_linger = Duration::from_millis(20);
  cfg
}

pub fn test_bus(name: &str) -> MessageBus {
  test_bus_with(name, test_config())
}

pub fn test_bus_with(name: &str, config: BusConfig) -> MessageBus {
  setup_tracing();
  MessageBus::new(name, config)
}

/// Allows connects, subscription propagation, and in-flight dispatch to land.
pub async fn settle() {
  tokio::time::sleep(Duration::from_millis(300)).await;
}

pub async fn brief() {
  tokio::time::sleep(Duration::from_millis(75)).await;
}
