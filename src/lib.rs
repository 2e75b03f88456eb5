//! EdgeFlow - distributed dataflow runtime for edge streaming pipelines
//!
//! Declare a graph of nodes (producers, consumers, fusion operators, sinks,
//! a gateway) and QoS-tagged links between them; the runtime executes one
//! OS process per node, moves timestamped frames through a dual-plane
//! streaming broker, and aggregates fan-in TCP at a gateway with external
//! HTTP/MJPEG/WebSocket faces.
//!
//! Module structure:
//! - `domain/` - frames, QoS policy, wiring records
//! - `infra/` - configuration, metrics, broker backings
//! - `io/` - output handlers, gateway TCP ingress, web interface
//! - `services/` - node lifecycle, fusion matching, wiring, gateway runtime

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;

pub use domain::{Frame, NodeConfig, QoS, WiringEnvelope};
pub use infra::broker::{Broker, BrokerConfig, DualPlaneBroker, DynBroker, StreamBroker};
pub use infra::Settings;
pub use io::WebInterface;
pub use services::registry::{
    register_consumer, register_fusion, register_gateway, register_producer, register_sink,
};
pub use services::{
    run, Consumer, Fusion, Gateway, Interface, Output, Producer, Sink, System,
};
