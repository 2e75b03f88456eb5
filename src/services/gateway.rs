//! Gateway runtime
//!
//! The terminal node of a graph: aggregates fan-in TCP from upstream nodes
//! and broadcasts every decoded frame to a set of pluggable interfaces
//! (web streaming, custom sinks). A background thread subscribes to the
//! system metrics channel and merges per-node reports into a shared table
//! the interfaces read for their stats output.

use crate::domain::frame::Frame;
use crate::infra::broker::{BrokerConfig, DynBroker};
use crate::infra::metrics::NodeReport;
use crate::io::tcp_ingress::run_tcp_ingress;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Latest report per node, merged from the metrics channel
pub type NodeReports = Arc<Mutex<HashMap<String, NodeReport>>>;

/// Shared handles every interface gets: the broker (for queue stats) and
/// the merged node reports.
#[derive(Clone)]
pub struct GatewayContext {
    pub system_name: String,
    pub broker: DynBroker,
    pub node_reports: NodeReports,
}

/// A pluggable consumer of frames arriving at the gateway.
#[async_trait]
pub trait Interface: Send + Sync {
    /// One-time initialization before any frame arrives.
    async fn setup(&self, ctx: &GatewayContext);

    /// Called for every decoded frame, concurrently with the other
    /// interfaces. Must not block for long - buffer and return.
    async fn on_frame(&self, frame: &Frame);

    /// Long-lived task (web server, broadcast loop). Runs until shutdown.
    async fn run_loop(&self, ctx: GatewayContext, shutdown: watch::Receiver<bool>);
}

pub struct GatewayRuntime {
    name: String,
    tcp_port: u16,
    interfaces: Vec<Arc<dyn Interface>>,
    active_clients: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl GatewayRuntime {
    pub fn new(name: &str, tcp_port: u16) -> Self {
        Self {
            name: name.to_string(),
            tcp_port,
            interfaces: Vec::new(),
            active_clients: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn add_interface(&mut self, interface: Arc<dyn Interface>) {
        self.interfaces.push(interface);
    }

    pub fn active_client_count(&self) -> usize {
        self.active_clients.lock().len()
    }

    /// Run ingress, interfaces and the metrics listener until shutdown.
    pub async fn run(
        &self,
        ctx: GatewayContext,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if self.interfaces.is_empty() {
            warn!(node = %self.name, "gateway_no_interfaces");
        }

        for interface in &self.interfaces {
            interface.setup(&ctx).await;
        }

        let listener_running = Arc::new(AtomicBool::new(true));
        spawn_metrics_listener(
            ctx.broker.to_config(),
            ctx.system_name.clone(),
            ctx.node_reports.clone(),
            listener_running.clone(),
        );

        for interface in &self.interfaces {
            let interface = interface.clone();
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                interface.run_loop(ctx, shutdown).await;
            });
        }

        let interfaces = Arc::new(self.interfaces.clone());
        let result = run_tcp_ingress(
            self.tcp_port,
            interfaces,
            self.active_clients.clone(),
            shutdown,
        )
        .await;

        listener_running.store(false, Ordering::Relaxed);
        info!(node = %self.name, "gateway_stopped");
        result
    }
}

/// Subscribe to `{system}:metrics` on a dedicated thread with a blocking
/// connection, merging reports into the shared table. Runs outside the
/// async runtime so a stalled subscription can never wedge the event loop.
fn spawn_metrics_listener(
    broker_config: BrokerConfig,
    system_name: String,
    reports: NodeReports,
    running: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let channel = format!("{system_name}:metrics");
        let url = format!("redis://{}:{}/", broker_config.host, broker_config.port);
        info!(channel = %channel, "metrics_listener_started");

        while running.load(Ordering::Relaxed) {
            let client = match redis::Client::open(url.as_str()) {
                Ok(client) => client,
                Err(e) => {
                    warn!(error = %e, "metrics_listener_client_failed");
                    return;
                }
            };
            let mut con = match client.get_connection() {
                Ok(con) => con,
                Err(e) => {
                    warn!(error = %e, "metrics_listener_connect_failed");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            };

            let mut pubsub = con.as_pubsub();
            // Bounded reads so the running flag is observed within a second
            if let Err(e) = pubsub.set_read_timeout(Some(Duration::from_secs(1))) {
                warn!(error = %e, "metrics_listener_timeout_failed");
            }
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(channel = %channel, error = %e, "metrics_listener_subscribe_failed");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }

            while running.load(Ordering::Relaxed) {
                match pubsub.get_message() {
                    Ok(msg) => {
                        let payload: String = msg.get_payload().unwrap_or_default();
                        match serde_json::from_str::<NodeReport>(&payload) {
                            Ok(report) => {
                                reports.lock().insert(report.node_name.clone(), report);
                            }
                            Err(e) => {
                                warn!(error = %e, "metrics_listener_bad_report");
                            }
                        }
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        warn!(error = %e, "metrics_listener_disconnected");
                        break;
                    }
                }
            }
        }
        info!(channel = %channel, "metrics_listener_stopped");
    });
}
