//! Blueprint registry and node factory table
//!
//! Two process-global tables, both write-only during the blueprint phase:
//!
//! - **Specs**: `NodeSpec` per path, memoized so multiple `System`s sharing
//!   a logical node get the same spec.
//! - **Factories**: path -> constructor, registered by the user before
//!   `run()`. This is the class loader: the launch phase materializes a
//!   role instance from an opaque path without any reflection.

use crate::domain::wiring::NodeConfig;
use crate::services::node::{Consumer, Fusion, Gateway, Producer, Role, Sink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// The five node roles. Used by wiring resolution to derive the transport
/// protocol without instantiating user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Producer,
    Consumer,
    Fusion,
    Sink,
    Gateway,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Producer => "producer",
            RoleKind::Consumer => "consumer",
            RoleKind::Fusion => "fusion",
            RoleKind::Sink => "sink",
            RoleKind::Gateway => "gateway",
        }
    }
}

/// Blueprint metadata for one node. Created at graph-declaration time,
/// never mutated after `run()`.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub path: String,
    pub name: String,
    pub config: NodeConfig,
}

impl NodeSpec {
    pub fn new(path: &str, config: NodeConfig) -> Self {
        Self {
            path: path.to_string(),
            name: derive_name(path),
            config,
        }
    }
}

/// Node name from a path: separators collapse to `_` and the conventional
/// `nodes` namespace prefix is removed. `"nodes/ai/yolo"` becomes
/// `"ai_yolo"`.
pub fn derive_name(path: &str) -> String {
    let collapsed = path.replace(['/', '\\'], "_");
    collapsed
        .strip_prefix("nodes_")
        .unwrap_or(&collapsed)
        .to_string()
}

type Factory = Box<dyn Fn() -> Role + Send + Sync>;

struct FactoryEntry {
    kind: RoleKind,
    factory: Factory,
}

static SPECS: LazyLock<Mutex<HashMap<String, NodeSpec>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static FACTORIES: LazyLock<Mutex<HashMap<String, FactoryEntry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Process-global spec registry.
pub struct NodeRegistry;

impl NodeRegistry {
    /// Memoized by path: a second registration returns the existing spec
    /// with the newer config applied.
    pub fn get_or_create(path: &str, config: NodeConfig) -> NodeSpec {
        let mut specs = SPECS.lock();
        match specs.get_mut(path) {
            Some(existing) => {
                existing.config = config;
                existing.clone()
            }
            None => {
                let spec = NodeSpec::new(path, config);
                specs.insert(path.to_string(), spec.clone());
                spec
            }
        }
    }

    pub fn get(path: &str) -> Option<NodeSpec> {
        SPECS.lock().get(path).cloned()
    }

    pub fn all() -> HashMap<String, NodeSpec> {
        SPECS.lock().clone()
    }
}

fn register(path: &str, kind: RoleKind, factory: Factory) {
    FACTORIES
        .lock()
        .insert(path.to_string(), FactoryEntry { kind, factory });
}

pub fn register_producer<F, P>(path: &str, factory: F)
where
    F: Fn() -> P + Send + Sync + 'static,
    P: Producer + 'static,
{
    register(path, RoleKind::Producer, Box::new(move || Role::Producer(Box::new(factory()))));
}

pub fn register_consumer<F, C>(path: &str, factory: F)
where
    F: Fn() -> C + Send + Sync + 'static,
    C: Consumer + 'static,
{
    register(path, RoleKind::Consumer, Box::new(move || Role::Consumer(Box::new(factory()))));
}

pub fn register_fusion<F, X>(path: &str, factory: F)
where
    F: Fn() -> X + Send + Sync + 'static,
    X: Fusion + 'static,
{
    register(path, RoleKind::Fusion, Box::new(move || Role::Fusion(Box::new(factory()))));
}

pub fn register_sink<F, S>(path: &str, factory: F)
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Sink + 'static,
{
    register(path, RoleKind::Sink, Box::new(move || Role::Sink(Box::new(factory()))));
}

pub fn register_gateway<F, G>(path: &str, factory: F)
where
    F: Fn() -> G + Send + Sync + 'static,
    G: Gateway + 'static,
{
    register(path, RoleKind::Gateway, Box::new(move || Role::Gateway(Box::new(factory()))));
}

/// Role kind behind a path, without instantiating it.
pub fn peek_kind(path: &str) -> Option<RoleKind> {
    FACTORIES.lock().get(path).map(|entry| entry.kind)
}

/// Instantiate the role registered behind a path. An unknown path is a
/// configuration fault: the child bootstrap exits non-zero on it.
pub fn materialize(path: &str) -> anyhow::Result<Role> {
    let factories = FACTORIES.lock();
    let entry = factories
        .get(path)
        .ok_or_else(|| anyhow::anyhow!("no node registered for path '{path}'"))?;
    Ok((entry.factory)())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NullCam;

    #[async_trait]
    impl Producer for NullCam {
        async fn produce(&mut self) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }
    }

    #[test]
    fn test_derive_name() {
        assert_eq!(derive_name("nodes/camera"), "camera");
        assert_eq!(derive_name("nodes/ai/yolo"), "ai_yolo");
        assert_eq!(derive_name("sensors/lidar"), "sensors_lidar");
    }

    #[test]
    fn test_factory_materialize_and_peek() {
        register_producer("nodes/test-null-cam", || NullCam);
        assert_eq!(peek_kind("nodes/test-null-cam"), Some(RoleKind::Producer));

        let role = materialize("nodes/test-null-cam").unwrap();
        assert_eq!(role.kind(), RoleKind::Producer);

        assert!(peek_kind("nodes/missing").is_none());
        assert!(materialize("nodes/missing").is_err());
    }

    #[test]
    fn test_spec_memoized_by_path() {
        let first = NodeRegistry::get_or_create(
            "nodes/test-registry-cam",
            NodeConfig::default().with_fps(30.0),
        );
        let second = NodeRegistry::get_or_create(
            "nodes/test-registry-cam",
            NodeConfig::default().with_fps(15.0),
        );
        assert_eq!(first.name, second.name);
        assert_eq!(
            NodeRegistry::get("nodes/test-registry-cam").unwrap().config.fps,
            15.0
        );
        assert!(NodeRegistry::all().contains_key("nodes/test-registry-cam"));
    }
}
