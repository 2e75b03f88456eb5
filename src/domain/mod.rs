//! Domain models - frames, QoS policy, and wiring records
//!
//! This module contains the canonical data types used throughout the system:
//! - `Frame` - the on-wire unit (id + timestamp + meta + payload)
//! - `QoS` - per-link consumption policy
//! - `WiringEnvelope` - per-node input/output description injected at launch

pub mod frame;
pub mod qos;
pub mod wiring;

pub use frame::{Frame, MalformedFrame};
pub use qos::QoS;
pub use wiring::{InputSpec, NodeConfig, OutputSpec, Protocol, WiringEnvelope};
