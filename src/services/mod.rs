//! Services - node lifecycle, wiring, and the gateway runtime
//!
//! - `node` - role traits, the per-process node runtime, QoS-dispatched loops
//! - `fusion` - timestamp matcher for multi-topic fusion nodes
//! - `registry` - process-global blueprint registry and node factory table
//! - `system` - declarative graph, wiring resolution, per-node launch
//! - `gateway` - fan-in gateway runtime and pluggable interfaces
//! - `jitter` - time-ordered release buffer used by gateway interfaces

pub mod fusion;
pub mod gateway;
pub mod jitter;
pub mod node;
pub mod registry;
pub mod system;

pub use gateway::{GatewayContext, Interface};
pub use jitter::TimeJitterBuffer;
pub use node::{Consumer, Fusion, Gateway, NodeRuntime, Output, Producer, Role, Sink};
pub use registry::{NodeRegistry, NodeSpec, RoleKind};
pub use system::{run, LinkBuilder, System};
