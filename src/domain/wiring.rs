//! Per-node wiring records
//!
//! The parent process resolves every link of a node into a `WiringEnvelope`
//! and hands it to the child via the `EDGEFLOW_WIRING` environment variable
//! as JSON. The child installs one output handler per `OutputSpec` and reads
//! its inputs per `InputSpec`.

use crate::domain::qos::QoS;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Environment variable carrying the serialized envelope
pub const WIRING_ENV: &str = "EDGEFLOW_WIRING";

/// How an output record reaches its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Publish to the broker topic named after this node
    Broker,
    /// Length-prefixed TCP push to a gateway
    Tcp,
}

/// One subscribed input: `topic` is the source node's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    pub topic: String,
    pub qos: QoS,
}

/// One resolved output edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub target: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    pub qos: QoS,
}

fn default_queue_size() -> usize {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WiringEnvelope {
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl WiringEnvelope {
    /// Parse the envelope from `EDGEFLOW_WIRING`, if present. A missing
    /// variable means the node runs unwired (no inputs, no outputs);
    /// malformed JSON is a configuration fault and fails the bootstrap.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        match std::env::var(WIRING_ENV) {
            Ok(raw) if !raw.is_empty() => {
                let envelope: Self = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse {WIRING_ENV}"))?;
                Ok(Some(envelope))
            }
            _ => Ok(None),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Per-node configuration from the blueprint. Well-known keys are typed;
/// anything else rides along in `extra` for user `setup()` code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_replicas() -> u32 {
    1
}

fn default_fps() -> f64 {
    30.0
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            device: None,
            fps: default_fps(),
            queue_size: default_queue_size(),
            node_port: None,
            extra: Map::new(),
        }
    }
}

impl NodeConfig {
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_node_port(mut self, port: u16) -> Self {
        self.node_port = Some(port);
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = WiringEnvelope {
            inputs: vec![InputSpec { topic: "cam".into(), qos: QoS::Realtime }],
            outputs: vec![
                OutputSpec {
                    target: "gateway".into(),
                    protocol: Protocol::Tcp,
                    channel: Some("yolo".into()),
                    queue_size: 1,
                    qos: QoS::Realtime,
                },
                OutputSpec {
                    target: "logger".into(),
                    protocol: Protocol::Broker,
                    channel: None,
                    queue_size: 30,
                    qos: QoS::Durable,
                },
            ],
        };

        let json = envelope.to_json();
        let parsed: WiringEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
        // channel is omitted when absent
        assert!(!json.contains("\"channel\":null"));
    }

    #[test]
    fn test_node_config_defaults_and_extra() {
        let parsed: NodeConfig =
            serde_json::from_str(r#"{"fps": 15, "model": "yolov8n"}"#).unwrap();
        assert_eq!(parsed.fps, 15.0);
        assert_eq!(parsed.replicas, 1);
        assert_eq!(parsed.queue_size, 1);
        assert_eq!(parsed.extra["model"], "yolov8n");
    }
}
