//! Declarative graph and per-node launch
//!
//! Blueprint phase: `System::node` registers specs by opaque path (no user
//! code is materialized), `System::link(..).to(..)` adds QoS-tagged edges.
//!
//! Launch phase: `run` unions the specs of all systems, concatenates their
//! links, resolves one `WiringEnvelope` per node, resets the broker once,
//! and spawns one OS process per node. Each child re-enters the same binary
//! with `EDGEFLOW_NODE` set; the bootstrap path rebinds the broker from
//! `EDGEFLOW_BROKER`, materializes the role from the factory table, and
//! executes it.

use crate::domain::qos::QoS;
use crate::domain::wiring::{InputSpec, NodeConfig, OutputSpec, Protocol, WiringEnvelope, WIRING_ENV};
use crate::infra::broker::{self, BrokerConfig, DynBroker, BROKER_ENV};
use crate::infra::config::Settings;
use crate::services::node::NodeRuntime;
use crate::services::registry::{self, NodeRegistry, NodeSpec, RoleKind};
use anyhow::Context;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Environment variable selecting child-bootstrap mode
pub const NODE_ENV: &str = "EDGEFLOW_NODE";

/// Environment variable carrying the owning system's name
pub const SYSTEM_ENV: &str = "EDGEFLOW_SYSTEM";

/// A directed edge between two registered nodes.
#[derive(Debug, Clone)]
pub struct Link {
    pub source: String,
    pub target: String,
    pub qos: QoS,
    pub channel: Option<String>,
}

/// A declarative dataflow graph. Holds paths and links only; user code
/// stays unloaded until launch.
pub struct System {
    name: String,
    broker: DynBroker,
    node_paths: Vec<String>,
    links: Vec<Link>,
}

impl System {
    pub fn new(name: &str, broker: DynBroker) -> Self {
        Self {
            name: name.to_string(),
            broker,
            node_paths: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> DynBroker {
        self.broker.clone()
    }

    /// Register a node blueprint. Memoized globally by path so systems can
    /// share a logical node.
    pub fn node(&mut self, path: &str, config: NodeConfig) -> NodeSpec {
        let spec = NodeRegistry::get_or_create(path, config);
        if !self.node_paths.iter().any(|p| p == path) {
            self.node_paths.push(path.to_string());
        }
        spec
    }

    /// Start a link from `source_path`; complete it with
    /// [`LinkBuilder::to`] or [`LinkBuilder::to_channel`].
    pub fn link(&mut self, source_path: &str) -> LinkBuilder<'_> {
        LinkBuilder {
            system: self,
            source: source_path.to_string(),
        }
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn node_paths(&self) -> &[String] {
        &self.node_paths
    }
}

pub struct LinkBuilder<'a> {
    system: &'a mut System,
    source: String,
}

impl LinkBuilder<'_> {
    pub fn to(self, target_path: &str, qos: QoS) {
        self.system.links.push(Link {
            source: self.source,
            target: target_path.to_string(),
            qos,
            channel: None,
        });
    }

    /// Like `to`, with a channel label tagging this source on the wire.
    /// Meaningful for gateway-typed targets, where the label keys the
    /// per-topic buffers and stats.
    pub fn to_channel(self, target_path: &str, qos: QoS, channel: &str) {
        self.system.links.push(Link {
            source: self.source,
            target: target_path.to_string(),
            qos,
            channel: Some(channel.to_string()),
        });
    }
}

/// Resolve all links touching one node into its wiring envelope.
///
/// Protocol is derived by peeking at the target's registered role: gateway
/// targets get a TCP push, everything else rides the broker. All broker
/// edges of one node publish to the same topic (the node's own name), so
/// they collapse into a single output record.
pub fn resolve_wiring(
    node_path: &str,
    specs: &HashMap<String, NodeSpec>,
    links: &[Link],
) -> WiringEnvelope {
    let mut envelope = WiringEnvelope::default();
    let queue_size = specs
        .get(node_path)
        .map(|spec| spec.config.queue_size)
        .unwrap_or(1);
    let mut has_broker_output = false;

    for link in links {
        if link.source == node_path {
            let Some(target) = specs.get(&link.target) else {
                warn!(source = %node_path, target = %link.target, "link_target_unregistered");
                continue;
            };

            let protocol = match registry::peek_kind(&link.target) {
                Some(RoleKind::Gateway) => Protocol::Tcp,
                _ => Protocol::Broker,
            };

            if protocol == Protocol::Broker {
                if has_broker_output {
                    continue;
                }
                has_broker_output = true;
            }

            envelope.outputs.push(OutputSpec {
                target: target.name.clone(),
                protocol,
                channel: link.channel.clone(),
                queue_size,
                qos: link.qos,
            });
        }

        if link.target == node_path {
            let Some(source) = specs.get(&link.source) else {
                warn!(source = %link.source, target = %node_path, "link_source_unregistered");
                continue;
            };
            envelope.inputs.push(InputSpec {
                topic: source.name.clone(),
                qos: link.qos,
            });
        }
    }

    envelope
}

/// Union node paths (deduplicated, declaration order) and concatenate the
/// links of several systems.
fn merge_blueprints(systems: &[System]) -> (Vec<String>, Vec<Link>) {
    let mut paths = Vec::new();
    let mut links = Vec::new();
    for system in systems {
        for path in &system.node_paths {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.clone());
            }
        }
        links.extend(system.links.iter().cloned());
    }
    (paths, links)
}

fn owning_system_name<'a>(systems: &'a [System], path: &str) -> &'a str {
    systems
        .iter()
        .find(|system| system.node_paths.iter().any(|p| p == path))
        .map(|system| system.name.as_str())
        .unwrap_or("edgeflow")
}

/// Run one or more systems.
///
/// In the parent this launches one child process per node and supervises
/// them until interrupted. Re-entered with `EDGEFLOW_NODE` set (the child
/// side of that launch), it bootstraps and executes that single node
/// instead.
pub async fn run(systems: Vec<System>) -> anyhow::Result<()> {
    if let Ok(node_path) = std::env::var(NODE_ENV) {
        if !node_path.is_empty() {
            return run_child(&node_path, &systems).await;
        }
    }
    run_parent(systems).await
}

async fn run_child(node_path: &str, systems: &[System]) -> anyhow::Result<()> {
    let spec = NodeRegistry::get(node_path)
        .with_context(|| format!("unknown node path '{node_path}'"))?;

    let settings = Settings::from_env();
    let name = settings
        .node_name()
        .map(str::to_string)
        .unwrap_or_else(|| spec.name.clone());
    let system_name = std::env::var(SYSTEM_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| owning_system_name(systems, node_path).to_string());

    // Rebind the broker from the parent's config bag; a standalone run
    // (no envelope in the environment) reuses the blueprint's broker.
    let broker = match BrokerConfig::from_env()? {
        Some(config) => broker::from_config(&config).await?,
        None => {
            let system = systems
                .iter()
                .find(|s| s.node_paths.iter().any(|p| p == node_path))
                .context("node not part of any system and no broker config in environment")?;
            system.broker()
        }
    };

    let role = registry::materialize(node_path)?;
    let mut runtime = NodeRuntime::new(&name, &system_name, spec.config.clone(), broker);
    if let Some(envelope) = WiringEnvelope::from_env()? {
        runtime.install_wiring(&envelope, &settings);
    }
    runtime.execute(role).await
}

async fn run_parent(systems: Vec<System>) -> anyhow::Result<()> {
    anyhow::ensure!(!systems.is_empty(), "no systems to run");

    let (paths, links) = merge_blueprints(&systems);
    anyhow::ensure!(!paths.is_empty(), "no nodes registered");

    // Fail fast on paths nothing was registered for
    for path in &paths {
        anyhow::ensure!(
            registry::peek_kind(path).is_some(),
            "no node registered for path '{path}'"
        );
    }

    let specs = NodeRegistry::all();
    let broker = systems[0].broker();

    // One reset for the whole launch, before any child can be reading
    broker.reset().await;
    let broker_json = broker.to_config().to_json();

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut children = Vec::new();

    for path in &paths {
        let spec = specs
            .get(path)
            .with_context(|| format!("missing spec for '{path}'"))?;
        let envelope = resolve_wiring(path, &specs, &links);

        let child = tokio::process::Command::new(&exe)
            .env(NODE_ENV, path)
            .env("NODE_NAME", &spec.name)
            .env(SYSTEM_ENV, owning_system_name(&systems, path))
            .env(BROKER_ENV, &broker_json)
            .env(WIRING_ENV, envelope.to_json())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn node '{}'", spec.name))?;

        info!(
            node = %spec.name,
            path = %path,
            pid = child.id().unwrap_or(0),
            inputs = %envelope.inputs.len(),
            outputs = %envelope.outputs.len(),
            "node_launched"
        );
        children.push((spec.name.clone(), child));
    }

    info!(nodes = %children.len(), "system_running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    info!("system_shutdown_requested");

    for (name, child) in &mut children {
        if let Err(e) = child.start_kill() {
            error!(node = %name, error = %e, "node_terminate_failed");
        }
    }
    for (name, mut child) in children {
        match child.wait().await {
            Ok(status) => info!(node = %name, status = %status, "node_terminated"),
            Err(e) => error!(node = %name, error = %e, "node_wait_failed"),
        }
    }

    info!("system_stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::wiring::NodeConfig;
    use crate::services::node::{Gateway, NodeContext, Producer, Sink};
    use crate::services::Interface;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::Map;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    struct TestCam;

    #[async_trait]
    impl Producer for TestCam {
        async fn produce(&mut self) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }
    }

    struct TestLogger;

    #[async_trait]
    impl Sink for TestLogger {
        async fn consume(&mut self, _payload: Bytes, _meta: &Map<String, serde_json::Value>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct TestHub;

    impl Gateway for TestHub {
        fn configure(&mut self, _ctx: &NodeContext) -> Vec<Arc<dyn Interface>> {
            Vec::new()
        }
    }

    fn spec_map(specs: &[NodeSpec]) -> StdHashMap<String, NodeSpec> {
        specs.iter().map(|s| (s.path.clone(), s.clone())).collect()
    }

    #[test]
    fn test_resolve_wiring_protocol_peek_and_dedup() {
        registry::register_producer("nodes/sys-test/cam", || TestCam);
        registry::register_sink("nodes/sys-test/logger", || TestLogger);
        registry::register_sink("nodes/sys-test/recorder", || TestLogger);
        registry::register_gateway("nodes/sys-test/hub", || TestHub);

        let specs = spec_map(&[
            NodeSpec::new("nodes/sys-test/cam", NodeConfig::default().with_queue_size(30)),
            NodeSpec::new("nodes/sys-test/logger", NodeConfig::default()),
            NodeSpec::new("nodes/sys-test/recorder", NodeConfig::default()),
            NodeSpec::new("nodes/sys-test/hub", NodeConfig::default()),
        ]);
        let links = vec![
            Link {
                source: "nodes/sys-test/cam".into(),
                target: "nodes/sys-test/logger".into(),
                qos: QoS::Durable,
                channel: None,
            },
            Link {
                source: "nodes/sys-test/cam".into(),
                target: "nodes/sys-test/recorder".into(),
                qos: QoS::Durable,
                channel: None,
            },
            Link {
                source: "nodes/sys-test/cam".into(),
                target: "nodes/sys-test/hub".into(),
                qos: QoS::Realtime,
                channel: Some("cam".into()),
            },
        ];

        let envelope = resolve_wiring("nodes/sys-test/cam", &specs, &links);

        // Two broker edges collapsed into one record, plus the TCP edge
        assert_eq!(envelope.outputs.len(), 2);
        let broker_outputs: Vec<_> = envelope
            .outputs
            .iter()
            .filter(|o| o.protocol == Protocol::Broker)
            .collect();
        assert_eq!(broker_outputs.len(), 1);
        assert_eq!(broker_outputs[0].queue_size, 30);

        let tcp_output = envelope
            .outputs
            .iter()
            .find(|o| o.protocol == Protocol::Tcp)
            .unwrap();
        assert_eq!(tcp_output.target, "sys-test_hub");
        assert_eq!(tcp_output.channel.as_deref(), Some("cam"));

        // The logger's side of the same graph
        let logger = resolve_wiring("nodes/sys-test/logger", &specs, &links);
        assert_eq!(logger.outputs.len(), 0);
        assert_eq!(logger.inputs.len(), 1);
        assert_eq!(logger.inputs[0].topic, "sys-test_cam");
        assert_eq!(logger.inputs[0].qos, QoS::Durable);
    }

    #[test]
    fn test_envelope_round_trips_through_env_json() {
        registry::register_producer("nodes/sys-env/cam", || TestCam);
        registry::register_sink("nodes/sys-env/logger", || TestLogger);

        let specs = spec_map(&[
            NodeSpec::new("nodes/sys-env/cam", NodeConfig::default()),
            NodeSpec::new("nodes/sys-env/logger", NodeConfig::default()),
        ]);
        let links = vec![Link {
            source: "nodes/sys-env/cam".into(),
            target: "nodes/sys-env/logger".into(),
            qos: QoS::Balanced,
            channel: None,
        }];

        let envelope = resolve_wiring("nodes/sys-env/cam", &specs, &links);
        let parsed: WiringEnvelope = serde_json::from_str(&envelope.to_json()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_multi_system_merge() {
        use crate::infra::broker::{Broker, QueueStats};
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
            async fn queue_stats(&self) -> StdHashMap<String, QueueStats> {
                StdHashMap::new()
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

        registry::register_producer("nodes/sys-merge/cam", || TestCam);
        registry::register_sink("nodes/sys-merge/logger", || TestLogger);

        let broker: DynBroker = Arc::new(NullBroker);

        let mut live = System::new("merge-live", broker.clone());
        live.node("nodes/sys-merge/cam", NodeConfig::default());

        let mut logging = System::new("merge-logging", broker.clone());
        // Shared node: same path registered in both systems
        logging.node("nodes/sys-merge/cam", NodeConfig::default());
        logging.node("nodes/sys-merge/logger", NodeConfig::default());
        logging
            .link("nodes/sys-merge/cam")
            .to("nodes/sys-merge/logger", QoS::Durable);

        let (paths, links) = merge_blueprints(&[live, logging]);
        assert_eq!(paths.len(), 2); // cam deduplicated
        assert_eq!(links.len(), 1);
        assert_eq!(
            owning_system_name(
                &[
                    System::new("empty", broker.clone()),
                ],
                "nodes/sys-merge/unknown"
            ),
            "edgeflow"
        );
    }
}
