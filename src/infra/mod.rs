//! Infrastructure - configuration, metrics, and the streaming broker
//!
//! - `config` - environment-driven settings (endpoints, identity)
//! - `metrics` - per-node runtime metrics and report payloads
//! - `broker` - dual-plane streaming broker and its QoS read paths

pub mod broker;
pub mod config;
pub mod metrics;

pub use config::Settings;
pub use metrics::{NodeMetrics, NodeReport};
