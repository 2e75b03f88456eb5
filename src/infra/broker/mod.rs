//! Streaming broker abstraction
//!
//! A broker presents topic-addressed, partially-ordered streams of encoded
//! frames with bounded memory, split into a control plane (ordered ids) and
//! a data plane (payload blobs with TTL). Two backings are provided:
//!
//! - [`StreamBroker`] - single plane; control-stream entries carry the full
//!   frame bytes.
//! - [`DualPlaneBroker`] - control stream carries only frame ids; payloads
//!   live in a separate key/value store under `{topic}:data:{frame_id}`.
//!
//! Read paths are QoS-dispatched: REALTIME skips to the stream tip with
//! per-reader dedup, DURABLE reads through a consumer group, BALANCED is
//! DURABLE with a skip-to-tip bypass once the group lags past a threshold.
//!
//! Failure policy: reads yield `None` on transient faults and TTL misses;
//! writes are fire-and-forget with a logged warning. Reconnection is handled
//! by the connection manager with exponential backoff (1 s base, 30 s cap).

pub mod dual;
pub mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use dual::DualPlaneBroker;
pub use stream::StreamBroker;

/// Environment variable carrying the parent's serialized broker config
pub const BROKER_ENV: &str = "EDGEFLOW_BROKER";

/// Key prefix recording the trim limit per topic, for stats reporting
pub const META_LIMIT_PREFIX: &str = "edgeflow:meta:limit:";

/// Default control-stream bound (approximate)
pub const DEFAULT_MAXLEN: usize = 100;

/// Default data-plane payload TTL; must cover the slowest consumer lag
pub const DEFAULT_TTL_SECS: u64 = 60;

/// Control-stream length snapshot for one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub current: usize,
    pub max: usize,
}

/// Self-describing bag for per-process rebinding. The parent serializes its
/// broker with `to_config()`; each child re-creates an equivalent instance
/// with `from_config()` without sharing any parent state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub class_path: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

fn default_maxlen() -> usize {
    DEFAULT_MAXLEN
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SECS
}

impl BrokerConfig {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the config injected by the parent via `EDGEFLOW_BROKER`.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        match std::env::var(BROKER_ENV) {
            Ok(raw) if !raw.is_empty() => {
                let config: Self = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("failed to parse {BROKER_ENV}: {e}"))?;
                Ok(Some(config))
            }
            _ => Ok(None),
        }
    }
}

/// Capability set every broker backing implements. Nodes depend only on
/// this trait; new backings plug in via `class_path` dispatch.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish encoded frame bytes to a topic. Fire-and-forget.
    async fn push(&self, topic: &str, data: Bytes);

    /// DURABLE read: one entry through `(group, consumer)`, acknowledged
    /// immediately. At-least-once per group within the retention window.
    async fn pop(&self, topic: &str, group: &str, consumer: &str, timeout: Duration)
        -> Option<Bytes>;

    /// REALTIME read: newest unseen entry for this reader, or `None` when
    /// nothing newer than the last returned entry arrives within `timeout`.
    async fn pop_latest(&self, topic: &str, timeout: Duration) -> Option<Bytes>;

    /// BALANCED read: DURABLE until the group lags more than
    /// `skip_threshold` entries behind the tip, then fast-forward the group
    /// to the tip and return the tip entry.
    async fn pop_balanced(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        skip_threshold: usize,
    ) -> Option<Bytes>;

    /// Bound the control stream to approximately `size` entries and record
    /// the limit for stats.
    async fn trim(&self, topic: &str, size: usize);

    /// Current control-stream length.
    async fn queue_size(&self, topic: &str) -> usize;

    /// `{current, max}` for every topic that has ever been trimmed.
    async fn queue_stats(&self) -> HashMap<String, QueueStats>;

    /// Truncate both planes and all in-memory reader state. Called once by
    /// the parent before any child launches.
    async fn reset(&self);

    /// Publish a payload on a pub/sub channel (metrics reports).
    async fn publish(&self, channel: &str, payload: String);

    fn to_config(&self) -> BrokerConfig;
}

pub type DynBroker = Arc<dyn Broker>;

/// Instantiate a broker from a config bag, dispatching on `class_path`.
/// This is the registration table the per-process bootstrap uses in place
/// of dynamic reflection.
pub async fn from_config(config: &BrokerConfig) -> anyhow::Result<DynBroker> {
    match config.class_path.as_str() {
        stream::CLASS_PATH => Ok(Arc::new(StreamBroker::from_config(config).await)),
        dual::CLASS_PATH => Ok(Arc::new(DualPlaneBroker::from_config(config).await)),
        other => anyhow::bail!("unknown broker class_path: {other}"),
    }
}

fn manager_config() -> ConnectionManagerConfig {
    // Reconnect backoff: 1 s base doubling up to 30 s
    ConnectionManagerConfig::new()
        .set_factor(1_000)
        .set_exponent_base(2)
        .set_max_delay(30_000)
        .set_connection_timeout(Duration::from_secs(5))
}

/// Connect to one plane, retrying with exponential backoff until the
/// endpoint is reachable.
pub(crate) async fn connect_with_backoff(host: &str, port: u16, plane: &str) -> ConnectionManager {
    let mut wait = Duration::from_secs(1);
    loop {
        match try_connect(host, port, Duration::from_secs(5)).await {
            Ok(manager) => {
                info!(host = %host, port = %port, plane = %plane, "broker_connected");
                return manager;
            }
            Err(e) => {
                warn!(
                    host = %host,
                    port = %port,
                    plane = %plane,
                    retry_in_secs = %wait.as_secs(),
                    error = %e,
                    "broker_connect_failed"
                );
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(Duration::from_secs(30));
            }
        }
    }
}

/// Single connection attempt bounded by `timeout`.
pub(crate) async fn try_connect(
    host: &str,
    port: u16,
    timeout: Duration,
) -> anyhow::Result<ConnectionManager> {
    let client = redis::Client::open(format!("redis://{host}:{port}/"))?;
    let manager = tokio::time::timeout(
        timeout,
        ConnectionManager::new_with_config(client, manager_config()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("connect timed out after {timeout:?}"))??;
    Ok(manager)
}

pub(crate) fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}
