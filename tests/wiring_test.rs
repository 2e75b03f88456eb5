//! Integration tests for blueprint declaration and wiring resolution

use async_trait::async_trait;
use bytes::Bytes;
use edgeflow::domain::wiring::Protocol;
use edgeflow::infra::broker::{Broker, BrokerConfig, DynBroker, QueueStats};
use edgeflow::services::node::NodeContext;
use edgeflow::services::registry::{self, NodeRegistry};
use edgeflow::services::system::resolve_wiring;
use edgeflow::{Interface, NodeConfig, Output, QoS, System, WiringEnvelope};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct NullBroker;

#[async_trait]
impl Broker for NullBroker {
    async fn push(&self, _topic: &str, _data: Bytes) {}
    async fn pop(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _timeout: Duration,
    ) -> Option<Bytes> {
        None
    }
    async fn pop_latest(&self, _topic: &str, _timeout: Duration) -> Option<Bytes> {
        None
    }
    async fn pop_balanced(
        &self,
        _topic: &str,
        _group: &str,
        _consumer: &str,
        _timeout: Duration,
        _skip_threshold: usize,
    ) -> Option<Bytes> {
        None
    }
    async fn trim(&self, _topic: &str, _size: usize) {}
    async fn queue_size(&self, _topic: &str) -> usize {
        0
    }
    async fn queue_stats(&self) -> HashMap<String, QueueStats> {
        HashMap::new()
    }
    async fn reset(&self) {}
    async fn publish(&self, _channel: &str, _payload: String) {}
    fn to_config(&self) -> BrokerConfig {
        BrokerConfig {
            class_path: "test::NullBroker".to_string(),
            host: "localhost".to_string(),
            port: 0,
            data_host: None,
            data_port: None,
            maxlen: 0,
            ttl_secs: 0,
        }
    }
}

struct Cam;

#[async_trait]
impl edgeflow::Producer for Cam {
    async fn produce(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(None)
    }
}

struct Yolo;

#[async_trait]
impl edgeflow::Consumer for Yolo {
    async fn process(
        &mut self,
        payload: Bytes,
        _meta: &Map<String, Value>,
    ) -> anyhow::Result<Option<Output>> {
        Ok(Some(payload.into()))
    }
}

struct Logger;

#[async_trait]
impl edgeflow::Sink for Logger {
    async fn consume(&mut self, _payload: Bytes, _meta: &Map<String, Value>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Hub;

impl edgeflow::Gateway for Hub {
    fn configure(&mut self, _ctx: &NodeContext) -> Vec<Arc<dyn Interface>> {
        Vec::new()
    }
}

fn null_broker() -> DynBroker {
    Arc::new(NullBroker)
}

#[test]
fn test_full_graph_resolution() {
    registry::register_producer("nodes/it/cam", || Cam);
    registry::register_consumer("nodes/it/yolo", || Yolo);
    registry::register_sink("nodes/it/logger", || Logger);
    registry::register_gateway("nodes/it/hub", || Hub);

    let mut system = System::new("it-robot", null_broker());
    system.node("nodes/it/cam", NodeConfig::default().with_fps(30.0).with_queue_size(30));
    system.node("nodes/it/yolo", NodeConfig::default().with_queue_size(1));
    system.node("nodes/it/logger", NodeConfig::default());
    system.node("nodes/it/hub", NodeConfig::default());

    system.link("nodes/it/cam").to("nodes/it/yolo", QoS::Realtime);
    system.link("nodes/it/cam").to("nodes/it/logger", QoS::Durable);
    system
        .link("nodes/it/yolo")
        .to_channel("nodes/it/hub", QoS::Realtime, "yolo");

    let specs = NodeRegistry::all();

    // Camera: two broker edges collapse into one handler record
    let cam = resolve_wiring("nodes/it/cam", &specs, system.links());
    assert!(cam.inputs.is_empty());
    assert_eq!(cam.outputs.len(), 1);
    assert_eq!(cam.outputs[0].protocol, Protocol::Broker);
    assert_eq!(cam.outputs[0].queue_size, 30);

    // Yolo: consumes the camera topic, pushes TCP to the gateway
    let yolo = resolve_wiring("nodes/it/yolo", &specs, system.links());
    assert_eq!(yolo.inputs.len(), 1);
    assert_eq!(yolo.inputs[0].topic, "it_cam");
    assert_eq!(yolo.inputs[0].qos, QoS::Realtime);
    assert_eq!(yolo.outputs.len(), 1);
    assert_eq!(yolo.outputs[0].protocol, Protocol::Tcp);
    assert_eq!(yolo.outputs[0].channel.as_deref(), Some("yolo"));

    // Logger: durable input from the camera, no outputs
    let logger = resolve_wiring("nodes/it/logger", &specs, system.links());
    assert_eq!(logger.inputs[0].qos, QoS::Durable);
    assert!(logger.outputs.is_empty());

    // Gateway: TCP-fed, so no broker inputs resolved as its own reads
    let hub = resolve_wiring("nodes/it/hub", &specs, system.links());
    assert_eq!(hub.inputs.len(), 1);
    assert!(hub.outputs.is_empty());
}

#[test]
fn test_shared_node_across_systems_gets_all_edges() {
    registry::register_producer("nodes/it2/cam", || Cam);
    registry::register_consumer("nodes/it2/yolo", || Yolo);
    registry::register_sink("nodes/it2/logger", || Logger);

    let mut live = System::new("it2-live", null_broker());
    live.node("nodes/it2/cam", NodeConfig::default().with_queue_size(10));
    live.node("nodes/it2/yolo", NodeConfig::default());
    live.link("nodes/it2/cam").to("nodes/it2/yolo", QoS::Realtime);

    let mut logging = System::new("it2-logging", null_broker());
    logging.node("nodes/it2/cam", NodeConfig::default().with_queue_size(10));
    logging.node("nodes/it2/logger", NodeConfig::default());
    logging.link("nodes/it2/cam").to("nodes/it2/logger", QoS::Durable);

    // Concatenated links: the shared camera sees both downstream edges
    let mut links = live.links().to_vec();
    links.extend(logging.links().iter().cloned());

    let specs = NodeRegistry::all();
    let cam = resolve_wiring("nodes/it2/cam", &specs, &links);
    // Both edges are broker edges over the same topic: one handler
    assert_eq!(cam.outputs.len(), 1);

    let yolo = resolve_wiring("nodes/it2/yolo", &specs, &links);
    let logger = resolve_wiring("nodes/it2/logger", &specs, &links);
    assert_eq!(yolo.inputs[0].topic, "it2_cam");
    assert_eq!(logger.inputs[0].topic, "it2_cam");
}

#[test]
fn test_envelope_env_round_trip() {
    registry::register_producer("nodes/it3/cam", || Cam);
    registry::register_gateway("nodes/it3/hub", || Hub);

    let mut system = System::new("it3", null_broker());
    system.node("nodes/it3/cam", NodeConfig::default());
    system.node("nodes/it3/hub", NodeConfig::default());
    system
        .link("nodes/it3/cam")
        .to_channel("nodes/it3/hub", QoS::Balanced, "cam");

    let specs = NodeRegistry::all();
    let envelope = resolve_wiring("nodes/it3/cam", &specs, system.links());

    let json = envelope.to_json();
    let parsed: WiringEnvelope = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, envelope);
    assert_eq!(parsed.outputs[0].qos, QoS::Balanced);
}
