//! Frame wire codec
//!
//! Layout (big-endian, byte-exact):
//! - [0..4)   frame_id   (u32)
//! - [4..12)  timestamp  (f64, seconds since epoch)
//! - [12..16) meta_len   (u32, bytes)
//! - [16..16+meta_len)  meta JSON (UTF-8)
//! - remainder          payload (opaque; by convention JPEG)
//!
//! Payloads are treated as opaque bytes end to end. The gateway uses the
//! zero-copy decode path so a frame can be re-emitted without touching the
//! payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Fixed header size: frame_id + timestamp + meta_len
pub const HEADER_LEN: usize = 16;

/// Decode failure. The packet is discarded by the caller, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed frame: {reason}")]
pub struct MalformedFrame {
    pub reason: String,
}

impl MalformedFrame {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Current wall-clock as float seconds since epoch
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The on-wire unit: id + timestamp + meta + payload.
///
/// Immutable once sent; `frame_id` is monotone per producer and `timestamp`
/// is the producer's wall-clock at emission, never rewritten downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_id: u32,
    pub timestamp: f64,
    pub meta: Map<String, Value>,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame stamped with the current wall-clock and a `trace.t0`
    /// mark. Used by producer loops.
    pub fn new(frame_id: u32, payload: Bytes) -> Self {
        let mut frame = Self {
            frame_id,
            timestamp: unix_now(),
            meta: Map::new(),
            payload,
        };
        frame.mark("t0");
        frame
    }

    /// Reassemble a frame from known parts (consumer forwarding path -
    /// keeps the upstream id and timestamp).
    pub fn with_parts(frame_id: u32, timestamp: f64, meta: Map<String, Value>, payload: Bytes) -> Self {
        Self { frame_id, timestamp, meta, payload }
    }

    /// Record the current time under `meta.trace[stage]`
    pub fn mark(&mut self, stage: &str) {
        let trace = self
            .meta
            .entry("trace".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = trace {
            map.insert(stage.to_string(), json!(unix_now()));
        }
    }

    fn trace_stamp(&self, stage: &str) -> Option<f64> {
        self.meta.get("trace")?.get(stage)?.as_f64()
    }

    /// Fold an upstream trace into this frame's meta. Stamps already
    /// present locally win; `t0` is stamped fresh when neither side
    /// carries one. Forwarding runners call this so latency tracking
    /// survives every hop, even when a hook replaces the meta wholesale.
    pub fn inherit_trace(&mut self, upstream_trace: Option<&Value>) {
        if let Some(Value::Object(upstream)) = upstream_trace {
            let trace = self
                .meta
                .entry("trace".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(map) = trace {
                for (stage, stamp) in upstream {
                    map.entry(stage.clone()).or_insert_with(|| stamp.clone());
                }
            }
        }
        if self.trace_stamp("t0").is_none() {
            self.mark("t0");
        }
    }

    /// End-to-end latency in milliseconds: `trace.gateway_in - trace.t0`.
    /// `None` until both stamps exist.
    pub fn latency_ms(&self) -> Option<f64> {
        let t0 = self.trace_stamp("t0")?;
        let gateway_in = self.trace_stamp("gateway_in")?;
        Some((gateway_in - t0) * 1000.0)
    }

    /// Source topic tag, set by `TcpHandler` before framing
    pub fn topic(&self) -> Option<&str> {
        self.meta.get("topic").and_then(Value::as_str)
    }

    pub fn set_topic(&mut self, topic: &str) {
        self.meta.insert("topic".to_string(), Value::String(topic.to_string()));
    }

    /// Serialize to the wire layout. Meta is rendered by serde_json, which
    /// emits canonical JSON for any numeric scalar or array in the map.
    pub fn encode(&self) -> Bytes {
        let meta_bytes = serde_json::to_vec(&self.meta).unwrap_or_else(|_| b"{}".to_vec());

        let mut buf = BytesMut::with_capacity(HEADER_LEN + meta_bytes.len() + self.payload.len());
        buf.put_u32(self.frame_id);
        buf.put_f64(self.timestamp);
        buf.put_u32(meta_bytes.len() as u32);
        buf.put_slice(&meta_bytes);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize, copying the payload out of `raw`.
    pub fn decode(raw: &[u8]) -> Result<Self, MalformedFrame> {
        Self::decode_shared(Bytes::copy_from_slice(raw))
    }

    /// Deserialize without copying the payload: the returned frame's payload
    /// is a slice of `raw`. This is the gateway ingress path, where the
    /// payload is forwarded verbatim and must never be re-encoded.
    pub fn decode_shared(raw: Bytes) -> Result<Self, MalformedFrame> {
        if raw.len() < HEADER_LEN {
            return Err(MalformedFrame::new(format!(
                "{} bytes, need at least {}",
                raw.len(),
                HEADER_LEN
            )));
        }

        let frame_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let timestamp = f64::from_be_bytes([
            raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
        ]);
        let meta_len = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]) as usize;

        let meta_end = HEADER_LEN + meta_len;
        if meta_end > raw.len() {
            return Err(MalformedFrame::new(format!(
                "meta length {} exceeds remaining {} bytes",
                meta_len,
                raw.len() - HEADER_LEN
            )));
        }

        let meta: Map<String, Value> = serde_json::from_slice(&raw[HEADER_LEN..meta_end])
            .map_err(|e| MalformedFrame::new(format!("meta JSON: {e}")))?;

        Ok(Self {
            frame_id,
            timestamp,
            meta,
            payload: raw.slice(meta_end..),
        })
    }

    /// Parse just the frame id from an encoded frame. The dual-plane broker
    /// uses this to key the data plane without a full decode.
    pub fn peek_frame_id(raw: &[u8]) -> Option<u32> {
        if raw.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_round_trip() {
        let payload: Bytes = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let frame = Frame::with_parts(
            42,
            1_700_000_000.5,
            meta(&[
                ("topic", json!("cam")),
                ("trace", json!({"t0": 1.0})),
            ]),
            payload,
        );

        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_shared_is_zero_copy_equivalent() {
        let frame = Frame::with_parts(7, 3.25, meta(&[("topic", json!("lidar"))]), Bytes::from_static(b"blob"));
        let encoded = frame.encode();

        let copied = Frame::decode(&encoded).unwrap();
        let shared = Frame::decode_shared(encoded).unwrap();
        assert_eq!(copied, shared);
        assert_eq!(shared.payload, Bytes::from_static(b"blob"));
    }

    #[test]
    fn test_decode_short_input() {
        let err = Frame::decode(&[0u8; 15]).unwrap_err();
        assert!(err.reason.contains("15 bytes"));
    }

    #[test]
    fn test_decode_meta_overrun() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_f64(2.0);
        buf.put_u32(1000); // claims 1000 meta bytes
        buf.put_slice(b"{}");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(err.reason.contains("exceeds remaining"));
    }

    #[test]
    fn test_decode_bad_json() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_f64(2.0);
        buf.put_u32(4);
        buf.put_slice(b"nope");
        let err = Frame::decode(&buf).unwrap_err();
        assert!(err.reason.contains("meta JSON"));
    }

    #[test]
    fn test_new_stamps_t0() {
        let frame = Frame::new(0, Bytes::new());
        assert!(frame.trace_stamp("t0").is_some());
        assert!(frame.timestamp > 0.0);
    }

    #[test]
    fn test_latency_needs_both_stamps() {
        let mut frame = Frame::new(0, Bytes::new());
        assert!(frame.latency_ms().is_none());
        frame.mark("gateway_in");
        let latency = frame.latency_ms().unwrap();
        assert!(latency >= 0.0);
    }

    #[test]
    fn test_inherit_trace_keeps_upstream_stamps() {
        let upstream = Frame::with_parts(
            1,
            10.0,
            meta(&[("trace", json!({"t0": 10.0, "yolo": 10.5}))]),
            Bytes::new(),
        );

        // The hook replaced the meta entirely, as consumer hooks do
        let mut forwarded =
            Frame::with_parts(1, 10.0, meta(&[("stage", json!("filter"))]), Bytes::new());
        forwarded.inherit_trace(upstream.meta.get("trace"));

        assert_eq!(forwarded.trace_stamp("t0"), Some(10.0));
        assert_eq!(forwarded.trace_stamp("yolo"), Some(10.5));
        assert_eq!(forwarded.meta["stage"], json!("filter"));

        forwarded.mark("gateway_in");
        assert!(forwarded.latency_ms().is_some());
    }

    #[test]
    fn test_inherit_trace_local_stamps_win() {
        let mut forwarded = Frame::with_parts(
            2,
            20.0,
            meta(&[("trace", json!({"t0": 20.0}))]),
            Bytes::new(),
        );
        forwarded.inherit_trace(Some(&json!({"t0": 5.0, "fused": 20.1})));

        assert_eq!(forwarded.trace_stamp("t0"), Some(20.0));
        assert_eq!(forwarded.trace_stamp("fused"), Some(20.1));
    }

    #[test]
    fn test_inherit_trace_stamps_t0_when_absent_everywhere() {
        let mut forwarded = Frame::with_parts(3, 30.0, Map::new(), Bytes::new());
        forwarded.inherit_trace(None);
        assert!(forwarded.trace_stamp("t0").is_some());
    }

    #[test]
    fn test_set_topic_overwrites() {
        let mut frame = Frame::new(0, Bytes::new());
        frame.set_topic("cam");
        frame.set_topic("yolo");
        assert_eq!(frame.topic(), Some("yolo"));
    }

    #[test]
    fn test_numeric_meta_values_survive() {
        // Inference metadata: integer, float and array scalars
        let frame = Frame::with_parts(
            1,
            1.0,
            meta(&[
                ("count", json!(3)),
                ("score", json!(0.875)),
                ("bbox", json!([10, 20, 110, 220])),
            ]),
            Bytes::new(),
        );
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.meta["count"], json!(3));
        assert_eq!(decoded.meta["score"], json!(0.875));
        assert_eq!(decoded.meta["bbox"], json!([10, 20, 110, 220]));
    }

    #[test]
    fn test_peek_frame_id() {
        let frame = Frame::with_parts(0xDEAD_BEEF, 0.0, Map::new(), Bytes::new());
        assert_eq!(Frame::peek_frame_id(&frame.encode()), Some(0xDEAD_BEEF));
        assert_eq!(Frame::peek_frame_id(&[1, 2]), None);
    }
}
