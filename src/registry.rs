//! Socket registry: one entry per `(pattern, port)`, with lazy construction,
//! bind/connect role fixed by pattern, and a failed-state cooldown that acts
//! as a circuit breaker when a peer or port is unavailable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::sleep;
use zeromq::{Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::metrics::{bump, Counters};

const BIND_HOST: &str = "0.0.0.0";
const CONNECT_HOST: &str = "127.0.0.1";

/// Messaging pattern of a socket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum SocketPattern {
  Pub,
  Sub,
  Push,
  Pull,
  Req,
  Rep,
}

/// Whether a pattern binds its port or connects to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketRole {
  Bind,
  Connect,
}

impl SocketPattern {
  pub fn role(self) -> SocketRole {
    match self {
      SocketPattern::Pub | SocketPattern::Pull | SocketPattern::Rep => SocketRole::Bind,
      SocketPattern::Sub | SocketPattern::Push | SocketPattern::Req => SocketRole::Connect,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      SocketPattern::Pub => "PUB",
      SocketPattern::Sub => "SUB",
      SocketPattern::Push => "PUSH",
      SocketPattern::Pull => "PULL",
      SocketPattern::Req => "REQ",
      SocketPattern::Rep => "REP",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketKey {
  pub pattern: SocketPattern,
  pub port: u16,
}

/// Concrete transport socket behind an entry.
pub(crate) enum PatternSocket {
  Pub(zeromq::PubSocket),
  Sub(zeromq::SubSocket),
  Push(zeromq::PushSocket),
  Pull(zeromq::PullSocket),
  Req(zeromq::ReqSocket),
  Rep(zeromq::RepSocket),
}

impl PatternSocket {
  pub async fn send(&mut self, msg: ZmqMessage) -> Result<(), zeromq::ZmqError> {
    match self {
      PatternSocket::Pub(s) => s.send(msg).await,
      PatternSocket::Push(s) => s.send(msg).await,
      PatternSocket::Req(s) => s.send(msg).await,
      PatternSocket::Rep(s) => s.send(msg).await,
      // The registry keys sockets by pattern; receive-only entries never
      // reach the send paths.
      PatternSocket::Sub(_) | PatternSocket::Pull(_) => unreachable!("send on receive-only socket"),
    }
  }

  pub async fn recv(&mut self) -> Result<ZmqMessage, zeromq::ZmqError> {
    match self {
      PatternSocket::Sub(s) => s.recv().await,
      PatternSocket::Pull(s) => s.recv().await,
      PatternSocket::Req(s) => s.recv().await,
      PatternSocket::Rep(s) => s.recv().await,
      PatternSocket::Pub(_) | PatternSocket::Push(_) => unreachable!("recv on send-only socket"),
    }
  }
}

/// One live socket plus the mutex serializing access to it. For REQ entries
/// the bus additionally holds a per-port request lock around the full
/// send/recv cycle.
pub(crate) struct SocketEntry {
  pub key: SocketKey,
  pub socket: tokio::sync::Mutex<PatternSocket>,
}

enum Slot {
  Healthy(Arc<SocketEntry>),
  Failed { at: Instant },
}

/// Outcome of [`SocketRegistry::acquire`].
pub(crate) enum Acquire {
  Ready(Arc<SocketEntry>),
  /// The entry failed recently and is cooling down (or the bus is closed).
  /// Callers count a drop and return without error to business logic.
  Unavailable,
}

pub(crate) struct SocketRegistry {
  table: Mutex<HashMap<SocketKey, Slot>>,
  counters: Arc<Counters>,
  cooldown: Duration,
  linger: Duration,
  hwm_outbound: u32,
  hwm_inbound: u32,
  closed: AtomicBool,
}

impl SocketRegistry {
  pub fn new(config: &BusConfig, counters: Arc<Counters>) -> Self {
    Self {
      table: Mutex::new(HashMap::new()),
      counters,
      cooldown: config.failed_socket_cooldown,
      linger: config.close_linger,
      hwm_outbound: config.hwm_outbound,
      hwm_inbound: config.hwm_inbound,
      closed: AtomicBool::new(false),
    }
  }

  /// Returns the healthy entry for `(pattern, port)`, constructing it on
  /// first use. A recently failed entry yields [`Acquire::Unavailable`] until
  /// the cooldown elapses, after which the next access rebuilds it (SUB
  /// subscriptions are reapplied from `topics`).
  ///
  /// Construction failures mark the slot failed: bind-role failures count in
  /// `failed_bind_count` and return [`BusError::Bind`]; connect-role failures
  /// count in `errors` and return [`BusError::Transport`].
  pub async fn acquire(
    &self,
    pattern: SocketPattern,
    port: u16,
    topics: &[String],
  ) -> Result<Acquire, BusError> {
    let key = SocketKey { pattern, port };
    if self.closed.load(Ordering::Acquire) {
      return Ok(Acquire::Unavailable);
    }
    {
      let table = self.table.lock();
      match table.get(&key) {
        Some(Slot::Healthy(entry)) => return Ok(Acquire::Ready(entry.clone())),
        Some(Slot::Failed { at }) if at.elapsed() < self.cooldown => {
          return Ok(Acquire::Unavailable)
        }
        _ => {}
      }
    }

    match self.open(pattern, port, topics).await {
      Ok(socket) => {
        let entry = Arc::new(SocketEntry {
          key,
          socket: tokio::sync::Mutex::new(socket),
        });
        let mut table = self.table.lock();
        if self.closed.load(Ordering::Acquire) {
          return Ok(Acquire::Unavailable);
        }
        // Lost a construction race; keep the registered entry.
        if let Some(Slot::Healthy(existing)) = table.get(&key) {
          return Ok(Acquire::Ready(existing.clone()));
        }
        table.insert(key, Slot::Healthy(entry.clone()));
        tracing::debug!(pattern = pattern.name(), port, "socket entry registered");
        Ok(Acquire::Ready(entry))
      }
      Err(e) => {
        self.table.lock().insert(key, Slot::Failed { at: Instant::now() });
        match pattern.role() {
          SocketRole::Bind => {
            bump(&self.counters.failed_bind_count);
            tracing::warn!(pattern = pattern.name(), port, error = %e, "bind failed");
            Err(BusError::Bind {
              port,
              reason: e.to_string(),
            })
          }
          SocketRole::Connect => {
            bump(&self.counters.errors);
            tracing::warn!(pattern = pattern.name(), port, error = %e, "connect failed");
            Err(BusError::Transport(e))
          }
        }
      }
    }
  }

  async fn open(
    &self,
    pattern: SocketPattern,
    port: u16,
    topics: &[String],
  ) -> Result<PatternSocket, zeromq::ZmqError> {
    let endpoint = match pattern.role() {
      SocketRole::Bind => format!("tcp://{BIND_HOST}:{port}"),
      SocketRole::Connect => format!("tcp://{CONNECT_HOST}:{port}"),
    };
    tracing::debug!(
      pattern = pattern.name(),
      %endpoint,
      hwm_outbound = self.hwm_outbound,
      hwm_inbound = self.hwm_inbound,
      "opening socket"
    );
    match pattern {
      SocketPattern::Pub => {
        let mut s = zeromq::PubSocket::new();
        s.bind(&endpoint).await?;
        Ok(PatternSocket::Pub(s))
      }
      SocketPattern::Sub => {
        let mut s = zeromq::SubSocket::new();
        s.connect(&endpoint).await?;
        if topics.is_empty() {
          // Empty set = subscribe-all.
          s.subscribe("").await?;
        } else {
          for topic in topics {
            s.subscribe(topic).await?;
          }
        }
        Ok(PatternSocket::Sub(s))
      }
      SocketPattern::Push => {
        let mut s = zeromq::PushSocket::new();
        s.connect(&endpoint).await?;
        Ok(PatternSocket::Push(s))
      }
      SocketPattern::Pull => {
        let mut s = zeromq::PullSocket::new();
        s.bind(&endpoint).await?;
        Ok(PatternSocket::Pull(s))
      }
      SocketPattern::Req => {
        let mut s = zeromq::ReqSocket::new();
        s.connect(&endpoint).await?;
        Ok(PatternSocket::Req(s))
      }
      SocketPattern::Rep => {
        let mut s = zeromq::RepSocket::new();
        s.bind(&endpoint).await?;
        Ok(PatternSocket::Rep(s))
      }
    }
  }

  /// Marks the entry failed as of now and retires its socket. Counter policy
  /// belongs to the caller: each failure path increments exactly one of the
  /// error/drop/backpressure counters itself.
  pub fn fail(&self, key: SocketKey) {
    let mut table = self.table.lock();
    if let Some(Slot::Healthy(entry)) = table.insert(key, Slot::Failed { at: Instant::now() }) {
      tracing::debug!(pattern = key.pattern.name(), port = key.port, "socket entry failed");
      self.retire(entry);
    }
  }

  /// Defers the final drop by the linger grace so in-flight writes can flush.
  fn retire(&self, entry: Arc<SocketEntry>) {
    let linger = self.linger;
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
      handle.spawn(async move {
        sleep(linger).await;
        drop(entry);
      });
    }
  }

  pub fn healthy_count(&self) -> usize {
    self
      .table
      .lock()
      .values()
      .filter(|slot| matches!(slot, Slot::Healthy(_)))
      .count()
  }

  /// Shuts the registry: no further acquisitions succeed, and every live
  /// socket is dropped after one linger grace.
  pub async fn close_all(&self) {
    self.closed.store(true, Ordering::Release);
    let entries: Vec<Arc<SocketEntry>> = {
      let mut table = self.table.lock();
      table
        .drain()
        .filter_map(|(_, slot)| match slot {
          Slot::Healthy(entry) => Some(entry),
          Slot::Failed { .. } => None,
        })
        .collect()
    };
    if !entries.is_empty() {
      sleep(self.linger).await;
      tracing::debug!(count = entries.len(), "socket family closed");
    }
  }
}
