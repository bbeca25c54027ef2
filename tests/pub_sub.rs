// tests/pub_sub.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use tickbus::{BusError, Handler, Payload};

mod common;

const PORT_BLOCK: u16 = 5600;

/// Handler that appends each message's `data` field to a shared list.
fn collector() -> (Arc<Mutex<Vec<Payload>>>, Handler) {
  let seen: Arc<Mutex<Vec<Payload>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  let handler = Handler::cooperative(move |message| {
    let sink = Arc::clone(&sink);
    async move {
      sink.lock().push(message["data"].clone());
      Ok(())
    }
  });
  (seen, handler)
}

#[tokio::test]
async fn fan_out_delivers_in_order() {
  let mut cfg = common::test_config();
  // Serial dispatch makes delivery order observable in the sink.
  cfg.handler_max_concurrency = Some(1);
  let bus = common::test_bus_with("alpha", cfg);
  let port = common::unique_port(PORT_BLOCK);

  // First publish binds the PUB socket so the subscriber has a peer.
  bus.publish("boot", json!({}), port).await;

  let (seen, handler) = collector();
  bus.register_handler("ticks", handler);
  let sub = bus.clone();
  let sub_task = tokio::spawn(async move { sub.subscribe_loop(port, &["ticks"]).await });
  common::settle().await;

  bus.publish("ticks", json!({ "n": 1 }), port).await;
  bus.publish("ticks", json!({ "n": 2 }), port).await;
  common::settle().await;

  assert_eq!(*seen.lock(), vec![json!({ "n": 1 }), json!({ "n": 2 })]);
  let metrics = bus.get_metrics();
  assert_eq!(metrics.messages_sent, 3); // boot + two ticks
  assert_eq!(metrics.messages_received, 2); // boot filtered at the transport
  assert_eq!(metrics.inbound_dropped, 0);

  bus.cleanup(true).await;
  assert!(sub_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn handler_failures_do_not_stop_the_loop() {
  let bus = common::test_bus("beta");
  let port = common::unique_port(PORT_BLOCK);
  bus.publish("boot", json!({}), port).await;

  let calls = Arc::new(AtomicUsize::new(0));
  let counted = Arc::clone(&calls);
  bus.register_handler(
    "risk",
    Handler::cooperative(move |_message| {
      let counted = Arc::clone(&counted);
      async move {
        counted.fetch_add(1, Ordering::SeqCst);
        Err(BusError::Handler("position limit math failed".into()))
      }
    }),
  );
  let sub = bus.clone();
  let sub_task = tokio::spawn(async move { sub.subscribe_loop(port, &[]).await });
  common::settle().await;

  for i in 0..3 {
    bus.publish("risk", json!({ "i": i }), port).await;
  }
  common::settle().await;

  assert_eq!(calls.load(Ordering::SeqCst), 3);
  let metrics = bus.get_metrics();
  assert_eq!(metrics.messages_received, 3);
  assert!(metrics.errors >= 3, "handler failures must be counted: {metrics:?}");

  // Re-registering the topic replaces the binding and the loop keeps serving.
  let (seen, replacement) = collector();
  bus.register_handler("risk", replacement);
  bus.publish("risk", json!({ "ok": true }), port).await;
  common::settle().await;
  assert_eq!(seen.lock().len(), 1);

  bus.cleanup(true).await;
  assert!(sub_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn dispatch_respects_concurrency_cap() {
  let mut cfg = common::test_config();
  cfg.handler_max_concurrency = Some(2);
  let bus = common::test_bus_with("gamma", cfg);
  let port = common::unique_port(PORT_BLOCK);
  bus.publish("boot", json!({}), port).await;

  let current = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));
  let done = Arc::new(AtomicUsize::new(0));
  let (current_h, peak_h, done_h) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&done));
  bus.register_handler(
    "load",
    Handler::cooperative(move |_message| {
      let current = Arc::clone(&current_h);
      let peak = Arc::clone(&peak_h);
      let done = Arc::clone(&done_h);
      async move {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        current.fetch_sub(1, Ordering::SeqCst);
        done.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    }),
  );
  let sub = bus.clone();
  let sub_task = tokio::spawn(async move { sub.subscribe_loop(port, &["load"]).await });
  common::settle().await;

  for i in 0..10 {
    bus.publish("load", json!({ "i": i }), port).await;
  }
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while done.load(Ordering::SeqCst) < 10 && tokio::time::Instant::now() < deadline {
    tokio::time::sleep(Duration::from_millis(25)).await;
  }

  assert_eq!(done.load(Ordering::SeqCst), 10);
  assert!(
    peak.load(Ordering::SeqCst) <= 2,
    "at most two handlers may run at once, saw {}",
    peak.load(Ordering::SeqCst)
  );

  bus.cleanup(true).await;
  assert!(sub_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn blocking_handlers_run_on_the_worker_pool() {
  let bus = common::test_bus("delta");
  let port = common::unique_port(PORT_BLOCK);
  bus.publish("boot", json!({}), port).await;

  let seen: Arc<Mutex<Vec<Payload>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&seen);
  bus.register_handler(
    "calc",
    Handler::blocking(move |message| {
      std::thread::sleep(Duration::from_millis(50));
      sink.lock().push(message["data"].clone());
      Ok(())
    }),
  );
  let sub = bus.clone();
  let sub_task = tokio::spawn(async move { sub.subscribe_loop(port, &["calc"]).await });
  common::settle().await;

  bus.publish("calc", json!({ "series": [1, 2, 3] }), port).await;
  bus.publish("calc", json!({ "series": [4, 5, 6] }), port).await;
  tokio::time::sleep(Duration::from_millis(500)).await;

  assert_eq!(seen.lock().len(), 2);
  assert_eq!(bus.get_metrics().messages_received, 2);

  bus.cleanup(true).await;
  assert!(sub_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn unhandled_topics_are_logged_and_skipped() {
  let bus = common::test_bus("epsilon");
  let port = common::unique_port(PORT_BLOCK);
  bus.publish("boot", json!({}), port).await;

  let sub = bus.clone();
  let sub_task = tokio::spawn(async move { sub.subscribe_loop(port, &[]).await });
  common::settle().await;

  bus.publish("nobody-listens", json!({ "x": 1 }), port).await;
  common::settle().await;

  let metrics = bus.get_metrics();
  assert_eq!(metrics.messages_received, 0);
  assert_eq!(metrics.inbound_dropped, 0);

  // The loop is still serving: a late registration starts receiving.
  let (seen, handler) = collector();
  bus.register_handler("somebody", handler);
  bus.publish("somebody", json!({ "y": 2 }), port).await;
  common::settle().await;
  assert_eq!(seen.lock().len(), 1);

  bus.cleanup(true).await;
  assert!(sub_task.await.unwrap().is_ok());
}
