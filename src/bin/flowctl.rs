//! Broker inspection tool
//!
//! Pokes at a running EdgeFlow deployment from the outside: queue stats,
//! live topic tailing, synthetic load, and the node metrics channel.
//!
//! Usage:
//!   flowctl stats
//!   flowctl tail cam --qos realtime
//!   flowctl publish cam --fps 30 --count 300 --size 4096
//!   flowctl metrics my-robot
//!
//! Endpoints come from the usual environment (`REDIS_HOST`, `REDIS_PORT`,
//! `DATA_REDIS_HOST`, `DATA_REDIS_PORT`).

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use edgeflow::domain::frame::unix_now;
use edgeflow::infra::broker::{DEFAULT_MAXLEN, DEFAULT_TTL_SECS};
use edgeflow::io::handlers::{BrokerHandler, OutputHandler};
use edgeflow::{DualPlaneBroker, DynBroker, Frame, Settings, StreamBroker};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// Dual-plane: control stream + payload store with TTL
    Dual,
    /// Single-plane: payloads inline in the control stream
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReadMode {
    /// Skip to the newest frame (at-most-once)
    Realtime,
    /// Read every frame through a consumer group
    Durable,
}

/// flowctl - EdgeFlow broker inspection tool
#[derive(Parser, Debug)]
#[command(name = "flowctl", version, about)]
struct Args {
    /// Which broker backing to talk to
    #[arg(long, value_enum, default_value_t = BrokerKind::Dual)]
    broker: BrokerKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print control-stream depth and trim limit for every tracked topic
    Stats,
    /// Decode and print frames from a topic as they arrive
    Tail {
        topic: String,
        #[arg(long, value_enum, default_value_t = ReadMode::Realtime)]
        qos: ReadMode,
        /// Consumer group for durable tailing
        #[arg(long, default_value = "flowctl")]
        group: String,
    },
    /// Publish synthetic frames to a topic
    Publish {
        topic: String,
        /// Frames per second
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
        /// Number of frames (0 = until interrupted)
        #[arg(long, default_value_t = 0)]
        count: u64,
        /// Payload size in bytes
        #[arg(long, default_value_t = 1024)]
        size: usize,
        /// Trim the topic to this many entries after each publish
        #[arg(long, default_value_t = 30)]
        queue_size: usize,
    },
    /// Subscribe to a system's metrics channel and print node reports
    Metrics { system: String },
}

async fn open_broker(kind: BrokerKind, settings: &Settings) -> DynBroker {
    match kind {
        BrokerKind::Dual => Arc::new(
            DualPlaneBroker::connect(
                settings.redis_host(),
                settings.redis_port(),
                settings.data_redis_host(),
                settings.data_redis_port(),
                DEFAULT_MAXLEN,
                DEFAULT_TTL_SECS,
            )
            .await,
        ),
        BrokerKind::Stream => Arc::new(
            StreamBroker::connect(settings.redis_host(), settings.redis_port(), DEFAULT_MAXLEN)
                .await,
        ),
    }
}

async fn show_stats(broker: DynBroker) {
    let stats = broker.queue_stats().await;
    if stats.is_empty() {
        println!("no tracked topics (nothing has been trimmed yet)");
        return;
    }

    let mut topics: Vec<_> = stats.iter().collect();
    topics.sort_by(|a, b| a.0.cmp(b.0));

    println!("{:<24} {:>8} {:>8}", "TOPIC", "DEPTH", "LIMIT");
    for (topic, queue) in topics {
        println!("{:<24} {:>8} {:>8}", topic, queue.current, queue.max);
    }
}

async fn tail(broker: DynBroker, topic: &str, qos: ReadMode, group: &str) {
    let consumer = Settings::from_env().hostname().to_string();
    println!("tailing '{topic}' ({qos:?}), ctrl-c to stop");

    loop {
        let packet = match qos {
            ReadMode::Realtime => broker.pop_latest(topic, Duration::from_secs(1)).await,
            ReadMode::Durable => {
                broker.pop(topic, group, &consumer, Duration::from_secs(1)).await
            }
        };

        let Some(packet) = packet else {
            continue;
        };

        match Frame::decode_shared(packet) {
            Ok(frame) => {
                let age_ms = (unix_now() - frame.timestamp) * 1000.0;
                let stages = frame
                    .meta
                    .get("trace")
                    .and_then(|t| t.as_object())
                    .map(|t| t.len())
                    .unwrap_or(0);
                println!(
                    "frame={:<8} ts={:.3} age={:>7.1}ms payload={:>7}B trace_stages={} meta={}",
                    frame.frame_id,
                    frame.timestamp,
                    age_ms,
                    frame.payload.len(),
                    stages,
                    serde_json::Value::Object(frame.meta.clone()),
                );
            }
            Err(e) => {
                eprintln!("undecodable packet: {e}");
            }
        }
    }
}

async fn publish(
    broker: DynBroker,
    topic: &str,
    fps: f64,
    count: u64,
    size: usize,
    queue_size: usize,
) {
    let mut handler = BrokerHandler::new(broker, topic, queue_size);
    let interval = Duration::from_secs_f64(1.0 / fps.max(0.1));
    println!("publishing to '{topic}' at {fps} fps ({size} B payloads), ctrl-c to stop");

    let mut sent: u64 = 0;
    loop {
        let payload: Bytes = (0..size).map(|i| ((i as u64 + sent) % 251) as u8).collect();
        let mut frame = Frame::new(sent as u32, payload);
        handler.send(&mut frame).await;

        sent += 1;
        if sent % 100 == 0 {
            println!("  {sent} frames sent");
        }
        if count > 0 && sent >= count {
            println!("done: {sent} frames");
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Blocking pub/sub subscription, printed as reports arrive. Runs on a
/// blocking thread so ctrl-c still lands promptly.
async fn watch_metrics(settings: Settings, system: String) {
    let url = format!("redis://{}:{}/", settings.redis_host(), settings.redis_port());
    let channel = format!("{system}:metrics");
    println!("listening on '{channel}', ctrl-c to stop");

    let listener = tokio::task::spawn_blocking(move || {
        let client = match redis::Client::open(url.as_str()) {
            Ok(client) => client,
            Err(e) => {
                eprintln!("bad redis url: {e}");
                return;
            }
        };
        let mut con = match client.get_connection() {
            Ok(con) => con,
            Err(e) => {
                eprintln!("connect failed: {e}");
                return;
            }
        };
        let mut pubsub = con.as_pubsub();
        if let Err(e) = pubsub.subscribe(&channel) {
            eprintln!("subscribe failed: {e}");
            return;
        }

        loop {
            match pubsub.get_message() {
                Ok(msg) => {
                    let payload: String = msg.get_payload().unwrap_or_default();
                    match serde_json::from_str::<edgeflow::infra::metrics::NodeReport>(&payload) {
                        Ok(report) => println!(
                            "{:<20} fps={:>7.2} latency={:>8.2}ms processing={:>8.2}ms",
                            report.node_name,
                            report.fps,
                            report.avg_latency_ms,
                            report.avg_processing_ms,
                        ),
                        Err(_) => println!("{payload}"),
                    }
                }
                Err(e) => {
                    eprintln!("subscription lost: {e}");
                    return;
                }
            }
        }
    });

    tokio::select! {
        _ = listener => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let settings = Settings::from_env();

    match args.command {
        Command::Stats => {
            let broker = open_broker(args.broker, &settings).await;
            show_stats(broker).await;
        }
        Command::Tail { topic, qos, group } => {
            let broker = open_broker(args.broker, &settings).await;
            tail(broker, &topic, qos, &group).await;
        }
        Command::Publish { topic, fps, count, size, queue_size } => {
            let broker = open_broker(args.broker, &settings).await;
            publish(broker, &topic, fps, count, size, queue_size).await;
        }
        Command::Metrics { system } => {
            watch_metrics(settings, system).await;
        }
    }
}
