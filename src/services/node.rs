//! Node lifecycle
//!
//! Every node is one of five roles sharing the `setup -> loop -> teardown`
//! contract. The runtime owns the loop: it reads inputs according to each
//! link's QoS, calls the user hook, and fans the result out through the
//! installed output handlers. User-code faults are logged and the frame
//! dropped; nothing a user hook does can take the loop down.

use crate::domain::frame::{unix_now, Frame};
use crate::domain::wiring::{InputSpec, NodeConfig, Protocol, WiringEnvelope};
use crate::infra::broker::DynBroker;
use crate::infra::config::Settings;
use crate::infra::metrics::NodeMetrics;
use crate::io::handlers::{BrokerHandler, OutputHandler, TcpHandler};
use crate::services::fusion::FusionMatcher;
use crate::services::gateway::{GatewayContext, GatewayRuntime, Interface};
use crate::services::registry::RoleKind;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Blocking-read timeout for consumer-side loops; also the cancellation
/// latency bound for a blocked read.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll timeout per topic in the fusion loop
const FUSION_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Entries a BALANCED group may lag behind the tip before skipping
const BALANCED_SKIP_THRESHOLD: usize = 10;

/// Cadence of node reports on the metrics channel
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// What a consumer/fusion hook hands back for forwarding. The runtime wraps
/// it in a frame that keeps the upstream id and timestamp.
pub struct Output {
    pub payload: Bytes,
    pub meta: Map<String, Value>,
}

impl Output {
    pub fn with_meta(payload: Bytes, meta: Map<String, Value>) -> Self {
        Self { payload, meta }
    }
}

impl From<Bytes> for Output {
    fn from(payload: Bytes) -> Self {
        Self { payload, meta: Map::new() }
    }
}

/// Everything a user hook can see about its own node.
#[derive(Clone)]
pub struct NodeContext {
    pub name: String,
    pub hostname: String,
    pub config: NodeConfig,
    pub broker: DynBroker,
}

#[async_trait]
pub trait Producer: Send {
    async fn setup(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of the source. `None` means nothing this tick; the runner
    /// still paces to the configured fps.
    async fn produce(&mut self) -> anyhow::Result<Option<Bytes>>;

    async fn teardown(&mut self) {}
}

#[async_trait]
pub trait Consumer: Send {
    async fn setup(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one upstream payload. `None` drops the frame.
    async fn process(
        &mut self,
        payload: Bytes,
        meta: &Map<String, Value>,
    ) -> anyhow::Result<Option<Output>>;

    async fn teardown(&mut self) {}
}

#[async_trait]
pub trait Fusion: Send {
    async fn setup(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Timestamp tolerance for matching, in seconds.
    fn slop(&self) -> f64 {
        0.1
    }

    /// Called with one time-aligned frame per input topic, base topic first.
    async fn fuse(&mut self, frames: Vec<Frame>) -> anyhow::Result<Option<Output>>;

    async fn teardown(&mut self) {}
}

#[async_trait]
pub trait Sink: Send {
    async fn setup(&mut self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Terminal consumption; no downstream.
    async fn consume(&mut self, payload: Bytes, meta: &Map<String, Value>) -> anyhow::Result<()>;

    async fn teardown(&mut self) {}
}

pub trait Gateway: Send {
    /// Register interfaces. Called once before the gateway starts serving.
    fn configure(&mut self, ctx: &NodeContext) -> Vec<Arc<dyn Interface>>;
}

/// A materialized node: one of the five roles.
pub enum Role {
    Producer(Box<dyn Producer>),
    Consumer(Box<dyn Consumer>),
    Fusion(Box<dyn Fusion>),
    Sink(Box<dyn Sink>),
    Gateway(Box<dyn Gateway>),
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Producer(_) => RoleKind::Producer,
            Role::Consumer(_) => RoleKind::Consumer,
            Role::Fusion(_) => RoleKind::Fusion,
            Role::Sink(_) => RoleKind::Sink,
            Role::Gateway(_) => RoleKind::Gateway,
        }
    }
}

/// Per-process node runtime: wiring, shutdown, metrics, and the role loop.
pub struct NodeRuntime {
    ctx: NodeContext,
    system_name: String,
    inputs: Vec<InputSpec>,
    handlers: Vec<Box<dyn OutputHandler>>,
    metrics: Arc<NodeMetrics>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    pub fn new(name: &str, system_name: &str, config: NodeConfig, broker: DynBroker) -> Self {
        let settings = Settings::from_env();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            ctx: NodeContext {
                name: name.to_string(),
                hostname: settings.hostname().to_string(),
                config,
                broker,
            },
            system_name: system_name.to_string(),
            inputs: Vec::new(),
            handlers: Vec::new(),
            metrics: Arc::new(NodeMetrics::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Install inputs and output handlers from a resolved envelope.
    ///
    /// Broker outputs publish to this node's own topic (the topic IS the
    /// source name); the resolution step has already collapsed multiple
    /// broker edges into one record. TCP outputs push to the gateway with
    /// the link's channel label (or the node name) as the wire source id.
    pub fn install_wiring(&mut self, envelope: &WiringEnvelope, settings: &Settings) {
        self.inputs = envelope.inputs.clone();

        for output in &envelope.outputs {
            match output.protocol {
                Protocol::Broker => {
                    self.handlers.push(Box::new(BrokerHandler::new(
                        self.ctx.broker.clone(),
                        &self.ctx.name,
                        output.queue_size,
                    )));
                }
                Protocol::Tcp => {
                    let source_id = output.channel.as_deref().unwrap_or(&self.ctx.name);
                    self.handlers.push(Box::new(TcpHandler::new(
                        settings.gateway_host(),
                        settings.gateway_tcp_port(),
                        source_id,
                    )));
                }
            }
        }

        info!(
            node = %self.ctx.name,
            inputs = ?self.inputs.iter().map(|i| i.topic.as_str()).collect::<Vec<_>>(),
            outputs = ?self.handlers.iter().map(|h| h.target()).collect::<Vec<_>>(),
            "node_wired"
        );
    }

    /// Run the node to completion: setup, role loop until shutdown,
    /// teardown. Consumes the runtime.
    pub async fn execute(mut self, role: Role) -> anyhow::Result<()> {
        // Root interrupt: flip the running flag observed at every
        // suspension point
        let interrupt_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("node_interrupt_received");
                let _ = interrupt_tx.send(true);
            }
        });

        info!(node = %self.ctx.name, role = %role.kind().as_str(), "node_starting");

        match role {
            Role::Producer(mut producer) => {
                producer.setup(&self.ctx).await?;
                self.run_producer(producer.as_mut()).await;
                producer.teardown().await;
            }
            Role::Consumer(mut consumer) => {
                consumer.setup(&self.ctx).await?;
                self.run_consumer(consumer.as_mut()).await;
                consumer.teardown().await;
            }
            Role::Fusion(mut fusion) => {
                fusion.setup(&self.ctx).await?;
                self.run_fusion(fusion.as_mut()).await;
                fusion.teardown().await;
            }
            Role::Sink(mut sink) => {
                sink.setup(&self.ctx).await?;
                self.run_sink(sink.as_mut()).await;
                sink.teardown().await;
            }
            Role::Gateway(mut gateway) => {
                self.run_gateway(gateway.as_mut()).await?;
            }
        }

        info!(node = %self.ctx.name, "node_stopped");
        Ok(())
    }

    fn running(&self) -> bool {
        !*self.shutdown_rx.borrow()
    }

    /// Dispatch the same frame to every output handler in order. A failing
    /// handler has already logged; the rest still get the frame.
    async fn send_result(handlers: &mut [Box<dyn OutputHandler>], frame: &mut Frame) {
        for handler in handlers.iter_mut() {
            handler.send(frame).await;
        }
    }

    /// QoS-dispatched read of one input.
    async fn read_input(&self, input: &InputSpec) -> Option<Bytes> {
        self.read_input_timeout(input, READ_TIMEOUT).await
    }

    async fn read_input_timeout(&self, input: &InputSpec, timeout: Duration) -> Option<Bytes> {
        use crate::domain::qos::QoS;
        match input.qos {
            QoS::Realtime => self.ctx.broker.pop_latest(&input.topic, timeout).await,
            QoS::Durable => {
                self.ctx
                    .broker
                    .pop(&input.topic, &self.ctx.name, &self.ctx.hostname, timeout)
                    .await
            }
            QoS::Balanced => {
                self.ctx
                    .broker
                    .pop_balanced(
                        &input.topic,
                        &self.ctx.name,
                        &self.ctx.hostname,
                        timeout,
                        BALANCED_SKIP_THRESHOLD,
                    )
                    .await
            }
        }
    }

    async fn maybe_publish_metrics(&self, last_publish: &mut Instant) {
        if last_publish.elapsed() < METRICS_INTERVAL {
            return;
        }
        *last_publish = Instant::now();
        let report = self.metrics.report(&self.ctx.name);
        if let Ok(payload) = serde_json::to_string(&report) {
            let channel = format!("{}:metrics", self.system_name);
            self.ctx.broker.publish(&channel, payload).await;
        }
    }

    async fn run_producer(&mut self, producer: &mut dyn Producer) {
        let fps = self.ctx.config.fps.max(0.1);
        let frame_interval = Duration::from_secs_f64(1.0 / fps);
        info!(node = %self.ctx.name, fps = %fps, "producer_started");

        let mut frame_id: u32 = 0;
        let mut last_publish = Instant::now();
        let mut shutdown = self.shutdown_rx.clone();

        while self.running() {
            let tick_start = Instant::now();

            match producer.produce().await {
                Ok(Some(payload)) => {
                    let mut frame = Frame::new(frame_id, payload);
                    frame_id = frame_id.wrapping_add(1);
                    Self::send_result(&mut self.handlers, &mut frame).await;

                    let spent = tick_start.elapsed().as_micros() as u64;
                    self.metrics.record_frame();
                    self.metrics.record_latency(spent, spent);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(node = %self.ctx.name, error = %e, "producer_loop_error");
                    self.metrics.record_loop_error();
                }
            }

            self.maybe_publish_metrics(&mut last_publish).await;

            let sleep_for = frame_interval.saturating_sub(tick_start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn run_consumer(&mut self, consumer: &mut dyn Consumer) {
        let Some(input) = self.inputs.first().cloned() else {
            warn!(node = %self.ctx.name, "consumer_no_input");
            return;
        };
        info!(
            node = %self.ctx.name,
            topic = %input.topic,
            qos = %input.qos.as_str(),
            "consumer_started"
        );

        let mut last_publish = Instant::now();

        while self.running() {
            let Some(packet) = self.read_input(&input).await else {
                continue;
            };

            let frame = match Frame::decode_shared(packet) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(node = %self.ctx.name, error = %e, "consumer_bad_frame");
                    continue;
                }
            };

            let process_start = Instant::now();
            match consumer.process(frame.payload.clone(), &frame.meta).await {
                Ok(Some(output)) => {
                    let processing_us = process_start.elapsed().as_micros() as u64;
                    let end_to_end_us =
                        ((unix_now() - frame.timestamp).max(0.0) * 1_000_000.0) as u64;
                    self.metrics.record_frame();
                    self.metrics.record_latency(processing_us, end_to_end_us);

                    // Forward with the upstream identity and trace intact
                    let mut out = Frame::with_parts(
                        frame.frame_id,
                        frame.timestamp,
                        output.meta,
                        output.payload,
                    );
                    out.inherit_trace(frame.meta.get("trace"));
                    Self::send_result(&mut self.handlers, &mut out).await;
                }
                Ok(None) => {
                    self.metrics.record_frame();
                }
                Err(e) => {
                    warn!(node = %self.ctx.name, error = %e, "consumer_loop_error");
                    self.metrics.record_loop_error();
                }
            }

            self.maybe_publish_metrics(&mut last_publish).await;
        }
    }

    async fn run_fusion(&mut self, fusion: &mut dyn Fusion) {
        if self.inputs.len() < 2 {
            warn!(node = %self.ctx.name, inputs = %self.inputs.len(), "fusion_needs_two_inputs");
        }
        let topics: Vec<String> = self.inputs.iter().map(|i| i.topic.clone()).collect();
        let mut matcher = FusionMatcher::new(&topics, fusion.slop());
        info!(node = %self.ctx.name, topics = ?topics, slop = %fusion.slop(), "fusion_started");

        let mut last_publish = Instant::now();

        while self.running() {
            for input in &self.inputs {
                if let Some(packet) = self.read_input_timeout(input, FUSION_POLL_TIMEOUT).await {
                    match Frame::decode_shared(packet) {
                        Ok(frame) => matcher.push(&input.topic, frame),
                        Err(e) => {
                            debug!(node = %self.ctx.name, error = %e, "fusion_bad_frame");
                        }
                    }
                }
            }

            if let Some(frames) = matcher.try_match(unix_now()) {
                let base_id = frames[0].frame_id;
                let base_ts = frames[0].timestamp;
                let base_trace = frames[0].meta.get("trace").cloned();

                let process_start = Instant::now();
                match fusion.fuse(frames).await {
                    Ok(Some(output)) => {
                        let processing_us = process_start.elapsed().as_micros() as u64;
                        let end_to_end_us =
                            ((unix_now() - base_ts).max(0.0) * 1_000_000.0) as u64;
                        self.metrics.record_frame();
                        self.metrics.record_latency(processing_us, end_to_end_us);

                        let mut out =
                            Frame::with_parts(base_id, base_ts, output.meta, output.payload);
                        out.inherit_trace(base_trace.as_ref());
                        Self::send_result(&mut self.handlers, &mut out).await;
                    }
                    Ok(None) => {
                        self.metrics.record_frame();
                    }
                    Err(e) => {
                        warn!(node = %self.ctx.name, error = %e, "fusion_loop_error");
                        self.metrics.record_loop_error();
                    }
                }
            }

            self.maybe_publish_metrics(&mut last_publish).await;
        }
    }

    async fn run_sink(&mut self, sink: &mut dyn Sink) {
        let Some(input) = self.inputs.first().cloned() else {
            warn!(node = %self.ctx.name, "sink_no_input");
            return;
        };
        // Sinks always read everything: consumer group named after the node
        info!(node = %self.ctx.name, topic = %input.topic, "sink_started");

        let mut last_publish = Instant::now();

        while self.running() {
            let Some(packet) = self
                .ctx
                .broker
                .pop(&input.topic, &self.ctx.name, &self.ctx.hostname, READ_TIMEOUT)
                .await
            else {
                continue;
            };

            let frame = match Frame::decode_shared(packet) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(node = %self.ctx.name, error = %e, "sink_bad_frame");
                    continue;
                }
            };

            self.metrics.record_frame();
            if let Err(e) = sink.consume(frame.payload, &frame.meta).await {
                warn!(node = %self.ctx.name, error = %e, "sink_loop_error");
                self.metrics.record_loop_error();
            }

            self.maybe_publish_metrics(&mut last_publish).await;
        }
    }

    async fn run_gateway(&mut self, gateway: &mut dyn Gateway) -> anyhow::Result<()> {
        let settings = Settings::from_env();
        let tcp_port = self
            .ctx
            .config
            .node_port
            .unwrap_or_else(|| settings.gateway_tcp_port());

        let mut runtime = GatewayRuntime::new(&self.ctx.name, tcp_port);
        for interface in gateway.configure(&self.ctx) {
            runtime.add_interface(interface);
        }

        let ctx = GatewayContext {
            system_name: self.system_name.clone(),
            broker: self.ctx.broker.clone(),
            node_reports: Arc::new(Mutex::new(HashMap::new())),
        };
        runtime.run(ctx, self.shutdown_rx.clone()).await
    }
}
