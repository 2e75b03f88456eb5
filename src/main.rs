//! EdgeFlow demo pipeline
//!
//! A small reference graph exercising the whole runtime: a synthetic
//! camera, a pass-through filter, a durable logger sink, and a gateway
//! with the web interface. Run it against a local Redis:
//!
//! ```text
//! edgeflow                 # parent: launches one process per node
//! edgeflow --node nodes/demo/cam   # child bootstrap for a single node
//! ```
//!
//! The parent normally re-invokes this same binary per node with
//! `EDGEFLOW_NODE` set; `--node` is the manual equivalent.

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use edgeflow::infra::broker::{DEFAULT_MAXLEN, DEFAULT_TTL_SECS};
use edgeflow::services::node::NodeContext;
use edgeflow::services::system::NODE_ENV;
use edgeflow::{
    register_consumer, register_gateway, register_producer, register_sink, DualPlaneBroker,
    DynBroker, Interface, NodeConfig, Output, QoS, Settings, System, WebInterface,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// EdgeFlow - dataflow runtime demo
#[derive(Parser, Debug)]
#[command(name = "edgeflow", version, about)]
struct Args {
    /// Run a single node by path instead of launching the whole graph
    #[arg(long)]
    node: Option<String>,
}

/// Synthetic camera: emits a deterministic byte pattern per tick.
struct DemoCam {
    counter: u32,
}

#[async_trait]
impl edgeflow::Producer for DemoCam {
    async fn produce(&mut self) -> anyhow::Result<Option<Bytes>> {
        self.counter = self.counter.wrapping_add(1);
        let mut payload = Vec::with_capacity(1024);
        // JPEG SOI marker so browser-side consumers treat parts as images
        payload.extend_from_slice(&[0xFF, 0xD8]);
        payload.extend((0..1020).map(|i| ((i as u32 + self.counter) % 251) as u8));
        payload.extend_from_slice(&[0xFF, 0xD9]);
        Ok(Some(Bytes::from(payload)))
    }
}

/// Pass-through stage stamping its name into the metadata.
struct DemoFilter;

#[async_trait]
impl edgeflow::Consumer for DemoFilter {
    async fn process(
        &mut self,
        payload: Bytes,
        _meta: &Map<String, Value>,
    ) -> anyhow::Result<Option<Output>> {
        let mut meta = Map::new();
        meta.insert("stage".to_string(), json!("filter"));
        Ok(Some(Output::with_meta(payload, meta)))
    }
}

/// Durable sink: counts frames, logs every 30th.
struct DemoLogger {
    frames: u64,
}

#[async_trait]
impl edgeflow::Sink for DemoLogger {
    async fn consume(&mut self, payload: Bytes, _meta: &Map<String, Value>) -> anyhow::Result<()> {
        self.frames += 1;
        if self.frames % 30 == 0 {
            info!(frames = %self.frames, last_bytes = %payload.len(), "logger_progress");
        }
        Ok(())
    }
}

/// Gateway with the stock web interface.
struct DemoHub;

impl edgeflow::Gateway for DemoHub {
    fn configure(&mut self, ctx: &NodeContext) -> Vec<Arc<dyn Interface>> {
        let settings = Settings::from_env();
        let http_port = ctx
            .config
            .extra
            .get("http_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or_else(|| settings.gateway_http_port());
        vec![Arc::new(WebInterface::new(http_port, 0.2))]
    }
}

fn register_nodes() {
    register_producer("nodes/demo/cam", || DemoCam { counter: 0 });
    register_consumer("nodes/demo/filter", || DemoFilter);
    register_sink("nodes/demo/logger", || DemoLogger { frames: 0 });
    register_gateway("nodes/demo/hub", || DemoHub);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    if let Some(node) = args.node {
        std::env::set_var(NODE_ENV, node);
    }

    let settings = Settings::from_env();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = option_env!("GIT_HASH").unwrap_or("unknown"),
        redis_host = %settings.redis_host(),
        redis_port = %settings.redis_port(),
        gateway_tcp_port = %settings.gateway_tcp_port(),
        gateway_http_port = %settings.gateway_http_port(),
        "edgeflow_starting"
    );

    register_nodes();

    let broker: DynBroker = Arc::new(
        DualPlaneBroker::connect(
            settings.redis_host(),
            settings.redis_port(),
            settings.data_redis_host(),
            settings.data_redis_port(),
            DEFAULT_MAXLEN,
            DEFAULT_TTL_SECS,
        )
        .await,
    );

    let mut system = System::new("edgeflow-demo", broker);
    system.node("nodes/demo/cam", NodeConfig::default().with_fps(15.0).with_queue_size(30));
    system.node("nodes/demo/filter", NodeConfig::default());
    system.node("nodes/demo/logger", NodeConfig::default());
    system.node("nodes/demo/hub", NodeConfig::default());

    system.link("nodes/demo/cam").to("nodes/demo/filter", QoS::Realtime);
    system.link("nodes/demo/cam").to("nodes/demo/logger", QoS::Durable);
    system
        .link("nodes/demo/cam")
        .to_channel("nodes/demo/hub", QoS::Realtime, "cam");
    system
        .link("nodes/demo/filter")
        .to_channel("nodes/demo/hub", QoS::Realtime, "filter");

    edgeflow::run(vec![system]).await
}
