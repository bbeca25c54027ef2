//! Payload serialization for the wire.
//!
//! Payloads are type-erased JSON values; the bus never inspects them beyond
//! the envelope keys it writes itself (`topic`, `sender`, `data`, `ts`). Two
//! codecs are built in: standards JSON (UTF-8, non-ASCII preserved) and
//! MessagePack as the compact fast path. The choice is fixed at bus
//! construction and both sides of a link must agree.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use thiserror::Error;

use crate::error::{DecodeError, EncodeError};

/// Opaque message payload. Conventionally a mapping, but the bus only
/// requires that it serializes.
pub type Payload = serde_json::Value;

/// Wire codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerKind {
  /// UTF-8 JSON. Interoperable and human-readable.
  Json,
  /// MessagePack. Smaller frames, cheaper to decode.
  MessagePack,
}

#[derive(Error, Debug)]
#[error("unknown serializer {0:?} (expected \"json\", \"fast\" or \"msgpack\")")]
pub struct UnknownSerializer(pub String);

impl FromStr for SerializerKind {
  type Err = UnknownSerializer;

  fn from_str(name: &str) -> Result<Self, Self::Err> {
    match name {
      "json" => Ok(SerializerKind::Json),
      "fast" | "msgpack" => Ok(SerializerKind::MessagePack),
      other => Err(UnknownSerializer(other.to_string())),
    }
  }
}

/// Encodes and decodes payloads with the codec chosen at construction.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
  kind: SerializerKind,
}

impl Serializer {
  pub fn new(kind: SerializerKind) -> Self {
    Self { kind }
  }

  pub fn kind(&self) -> SerializerKind {
    self.kind
  }

  pub fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
    match self.kind {
      SerializerKind::Json => serde_json::to_vec(payload).map_err(|e| EncodeError {
        codec: "json",
        reason: e.to_string(),
      }),
      SerializerKind::MessagePack => rmp_serde::to_vec(payload).map_err(|e| EncodeError {
        codec: "msgpack",
        reason: e.to_string(),
      }),
    }
  }

  pub fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
    match self.kind {
      SerializerKind::Json => serde_json::from_slice(bytes).map_err(|e| DecodeError {
        codec: "json",
        reason: e.to_string(),
      }),
      SerializerKind::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| DecodeError {
        codec: "msgpack",
        reason: e.to_string(),
      }),
    }
  }
}

/// Current time as float Unix seconds, the `ts` convention on every envelope.
pub(crate) fn unix_ts() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs_f64())
    .unwrap_or(0.0)
}

/// Envelope for the publish path: two-frame datagrams carry the topic again
/// inside the payload so handlers can route without the frame.
pub(crate) fn event_envelope(topic: &str, sender: &str, data: Payload) -> Payload {
  json!({ "topic": topic, "sender": sender, "data": data, "ts": unix_ts() })
}

/// Envelope for the push and request paths: single-frame datagrams.
pub(crate) fn stream_envelope(sender: &str, data: Payload) -> Payload {
  json!({ "sender": sender, "data": data, "ts": unix_ts() })
}

/// Reply sent when a responder fails; keeps the REP state machine satisfied.
pub(crate) fn error_envelope(detail: &str) -> Payload {
  json!({ "error": detail })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Payload {
    json!({
      "topic": "MARKET_DATA",
      "data": { "symbol": "BTC/USDT", "price": 64210.5, "depth": [1, 2, 3] },
      "ts": 1714000000.25,
    })
  }

  #[test]
  fn json_round_trip() {
    let s = Serializer::new(SerializerKind::Json);
    let bytes = s.encode(&sample()).unwrap();
    assert_eq!(s.decode(&bytes).unwrap(), sample());
  }

  #[test]
  fn msgpack_round_trip() {
    let s = Serializer::new(SerializerKind::MessagePack);
    let bytes = s.encode(&sample()).unwrap();
    assert_eq!(s.decode(&bytes).unwrap(), sample());
  }

  #[test]
  fn json_preserves_non_ascii() {
    let s = Serializer::new(SerializerKind::Json);
    let payload = json!({ "symbol": "上证指数", "note": "füße" });
    let bytes = s.encode(&payload).unwrap();
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.contains("上证指数"), "non-ASCII must not be escaped: {text}");
    assert_eq!(s.decode(&bytes).unwrap(), payload);
  }

  #[test]
  fn decode_failure_names_codec() {
    let s = Serializer::new(SerializerKind::Json);
    let err = s.decode(b"{not json").unwrap_err();
    assert_eq!(err.codec, "json");
  }

  #[test]
  fn kind_parsing() {
    assert_eq!("json".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
    assert_eq!("fast".parse::<SerializerKind>().unwrap(), SerializerKind::MessagePack);
    assert_eq!("msgpack".parse::<SerializerKind>().unwrap(), SerializerKind::MessagePack);
    assert!("protobuf".parse::<SerializerKind>().is_err());
  }

  #[test]
  fn envelopes_carry_convention_keys() {
    let env = event_envelope("GLOBAL_STEP", "scheduler", json!({ "step": 7 }));
    assert_eq!(env["topic"], "GLOBAL_STEP");
    assert_eq!(env["sender"], "scheduler");
    assert_eq!(env["data"]["step"], 7);
    assert!(env["ts"].as_f64().unwrap() > 0.0);
  }
}
