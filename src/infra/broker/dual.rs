//! Dual-plane broker
//!
//! Control entries carry only the frame id; the encoded frame lives in a
//! separate key/value plane under `{topic}:data:{frame_id}` with a TTL.
//! Keeps the ordered stream light while heavy payloads age out on their
//! own - an orphaned payload is reclaimed by TTL, a trimmed control entry
//! simply never gets fetched.
//!
//! When the configured data endpoint is a loopback host that is not
//! reachable at startup, the broker falls back to the control endpoint so
//! local single-store setups work untouched. Non-loopback configurations
//! are trusted as-is and block until the data plane comes up.

use super::{
    connect_with_backoff, is_loopback, try_connect, Broker, BrokerConfig, QueueStats,
    META_LIMIT_PREFIX,
};
use crate::domain::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CLASS_PATH: &str = "edgeflow::DualPlaneBroker";

/// Probe window for the local data-plane fallback
const DATA_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DualPlaneBroker {
    ctrl_host: String,
    ctrl_port: u16,
    data_host: String,
    data_port: u16,
    maxlen: usize,
    ttl_secs: u64,
    ctrl: ConnectionManager,
    data: ConnectionManager,
    /// Both planes resolved to the same endpoint (fallback or config)
    shared_planes: bool,
    groups: Mutex<FxHashSet<String>>,
    last_seen: Mutex<FxHashMap<String, String>>,
}

impl DualPlaneBroker {
    pub async fn connect(
        ctrl_host: &str,
        ctrl_port: u16,
        data_host: &str,
        data_port: u16,
        maxlen: usize,
        ttl_secs: u64,
    ) -> Self {
        let ctrl = connect_with_backoff(ctrl_host, ctrl_port, "control").await;

        let same_endpoint = data_host == ctrl_host && data_port == ctrl_port;
        let (data, data_host, data_port, shared_planes) = if same_endpoint {
            (ctrl.clone(), ctrl_host.to_string(), ctrl_port, true)
        } else if is_loopback(data_host) {
            match try_connect(data_host, data_port, DATA_PROBE_TIMEOUT).await {
                Ok(data) => {
                    info!(host = %data_host, port = %data_port, plane = "data", "broker_connected");
                    (data, data_host.to_string(), data_port, false)
                }
                Err(e) => {
                    warn!(
                        host = %data_host,
                        port = %data_port,
                        fallback_port = %ctrl_port,
                        error = %e,
                        "broker_data_plane_fallback"
                    );
                    (ctrl.clone(), ctrl_host.to_string(), ctrl_port, true)
                }
            }
        } else {
            let data = connect_with_backoff(data_host, data_port, "data").await;
            (data, data_host.to_string(), data_port, false)
        };

        Self {
            ctrl_host: ctrl_host.to_string(),
            ctrl_port,
            data_host,
            data_port,
            maxlen,
            ttl_secs,
            ctrl,
            data,
            shared_planes,
            groups: Mutex::new(FxHashSet::default()),
            last_seen: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn from_config(config: &BrokerConfig) -> Self {
        let data_host = config.data_host.clone().unwrap_or_else(|| config.host.clone());
        let data_port = config.data_port.unwrap_or(config.port);
        Self::connect(
            &config.host,
            config.port,
            &data_host,
            data_port,
            config.maxlen,
            config.ttl_secs,
        )
        .await
    }

    async fn ensure_group(&self, topic: &str, group: &str) {
        let key = format!("{topic}:{group}");
        if self.groups.lock().contains(&key) {
            return;
        }

        let mut con = self.ctrl.clone();
        let created: Result<(), _> = con.xgroup_create_mkstream(topic, group, "0").await;
        match created {
            Ok(()) => {
                self.groups.lock().insert(key);
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                self.groups.lock().insert(key);
            }
            Err(e) => {
                warn!(topic = %topic, group = %group, error = %e, "broker_group_create_failed");
            }
        }
    }

    /// Resolve a control entry to its payload on the data plane. A missing
    /// key means the TTL won the race; the reader just moves on.
    async fn fetch_payload(&self, topic: &str, frame_id: u32) -> Option<Bytes> {
        let key = format!("{topic}:data:{frame_id}");
        let mut con = self.data.clone();
        match con.get::<_, Option<Vec<u8>>>(&key).await {
            Ok(Some(raw)) => Some(Bytes::from(raw)),
            Ok(None) => {
                debug!(topic = %topic, frame_id = %frame_id, "broker_payload_expired");
                None
            }
            Err(e) => {
                warn!(topic = %topic, frame_id = %frame_id, error = %e, "broker_payload_fetch_failed");
                None
            }
        }
    }

    async fn group_read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Option<(String, u32)> {
        self.ensure_group(topic, group).await;

        let mut con = self.ctrl.clone();
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(timeout.as_millis() as usize);

        let reply: StreamReadReply = match con.xread_options(&[topic], &[">"], &opts).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(topic = %topic, group = %group, error = %e, "broker_pop_failed");
                // Pace retries while the connection manager reconnects
                tokio::time::sleep(Duration::from_secs(1)).await;
                return None;
            }
        };

        let entry = reply.keys.first()?.ids.first()?.clone();
        let acked: Result<i64, _> = con.xack(topic, group, &[&entry.id]).await;
        if let Err(e) = acked {
            warn!(topic = %topic, group = %group, error = %e, "broker_ack_failed");
        }

        entry_frame_id(&entry).map(|frame_id| (entry.id, frame_id))
    }

    async fn tip(&self, topic: &str) -> Option<StreamId> {
        let mut con = self.ctrl.clone();
        let reply: StreamRangeReply = match con.xrevrange_count(topic, "+", "-", 1).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broker_tip_read_failed");
                return None;
            }
        };
        reply.ids.into_iter().next()
    }
}

fn entry_frame_id(entry: &StreamId) -> Option<u32> {
    entry.get::<u32>("frame_id")
}

#[async_trait]
impl Broker for DualPlaneBroker {
    async fn push(&self, topic: &str, data: Bytes) {
        let Some(frame_id) = Frame::peek_frame_id(&data) else {
            return;
        };
        let data_key = format!("{topic}:data:{frame_id}");

        if self.shared_planes {
            // One round trip: payload write and control append pipelined
            let mut con = self.ctrl.clone();
            let mut pipe = redis::pipe();
            pipe.set_ex(&data_key, &data[..], self.ttl_secs).ignore();
            pipe.xadd_maxlen(
                topic,
                StreamMaxlen::Approx(self.maxlen),
                "*",
                &[("frame_id", frame_id)],
            )
            .ignore();
            if let Err(e) = pipe.query_async::<()>(&mut con).await {
                warn!(topic = %topic, error = %e, "broker_push_failed");
            }
            return;
        }

        let mut data_con = self.data.clone();
        let stored: Result<(), _> = data_con.set_ex(&data_key, &data[..], self.ttl_secs).await;
        if let Err(e) = stored {
            warn!(topic = %topic, error = %e, "broker_payload_store_failed");
            return;
        }

        let mut ctrl_con = self.ctrl.clone();
        let added: Result<String, _> = ctrl_con
            .xadd_maxlen(
                topic,
                StreamMaxlen::Approx(self.maxlen),
                "*",
                &[("frame_id", frame_id)],
            )
            .await;
        if let Err(e) = added {
            warn!(topic = %topic, error = %e, "broker_push_failed");
        }
    }

    async fn pop(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Option<Bytes> {
        let (_, frame_id) = self.group_read(topic, group, consumer, timeout).await?;
        self.fetch_payload(topic, frame_id).await
    }

    async fn pop_latest(&self, topic: &str, timeout: Duration) -> Option<Bytes> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(entry) = self.tip(topic).await {
                let fresh = {
                    let mut last_seen = self.last_seen.lock();
                    if last_seen.get(topic) != Some(&entry.id) {
                        last_seen.insert(topic.to_string(), entry.id.clone());
                        true
                    } else {
                        false
                    }
                };
                if fresh {
                    let frame_id = entry_frame_id(&entry)?;
                    return self.fetch_payload(topic, frame_id).await;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let mut con = self.ctrl.clone();
            let opts = StreamReadOptions::default()
                .count(1)
                .block((remaining.as_millis() as usize).max(1));
            let waited: Result<StreamReadReply, _> =
                con.xread_options(&[topic], &["$"], &opts).await;
            if let Err(e) = waited {
                warn!(topic = %topic, error = %e, "broker_wait_failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return None;
            }
        }
    }

    async fn pop_balanced(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        skip_threshold: usize,
    ) -> Option<Bytes> {
        let (id, frame_id) = self.group_read(topic, group, consumer, timeout).await?;

        let mut con = self.ctrl.clone();
        let behind: StreamRangeReply = match con
            .xrange_count(topic, format!("({id}"), "+", skip_threshold + 1)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broker_lag_check_failed");
                return self.fetch_payload(topic, frame_id).await;
            }
        };

        if behind.ids.len() <= skip_threshold {
            return self.fetch_payload(topic, frame_id).await;
        }

        debug!(topic = %topic, group = %group, lag = %behind.ids.len(), "broker_balanced_skip");
        let forwarded: Result<(), _> = con.xgroup_setid(topic, group, "$").await;
        if let Err(e) = forwarded {
            warn!(topic = %topic, group = %group, error = %e, "broker_setid_failed");
        }

        let tip_frame_id = match self.tip(topic).await.as_ref().and_then(entry_frame_id) {
            Some(tip_id) => tip_id,
            None => frame_id,
        };
        self.fetch_payload(topic, tip_frame_id).await
    }

    async fn trim(&self, topic: &str, size: usize) {
        let mut con = self.ctrl.clone();
        let trimmed: Result<i64, _> = con.xtrim(topic, StreamMaxlen::Approx(size)).await;
        if let Err(e) = trimmed {
            warn!(topic = %topic, error = %e, "broker_trim_failed");
            return;
        }
        let recorded: Result<(), _> = con.set(format!("{META_LIMIT_PREFIX}{topic}"), size).await;
        if let Err(e) = recorded {
            warn!(topic = %topic, error = %e, "broker_limit_record_failed");
        }
    }

    async fn queue_size(&self, topic: &str) -> usize {
        let mut con = self.ctrl.clone();
        con.xlen(topic).await.unwrap_or(0)
    }

    async fn queue_stats(&self) -> HashMap<String, QueueStats> {
        let mut stats = HashMap::new();
        let mut con = self.ctrl.clone();

        let keys: Vec<String> = match con.keys(format!("{META_LIMIT_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "broker_stats_failed");
                return stats;
            }
        };

        for key in keys {
            let topic = key.trim_start_matches(META_LIMIT_PREFIX).to_string();
            let max: usize = con.get(&key).await.unwrap_or(self.maxlen);
            let current: usize = con.xlen(&topic).await.unwrap_or(0);
            stats.insert(topic, QueueStats { current, max });
        }
        stats
    }

    async fn reset(&self) {
        let mut ctrl = self.ctrl.clone();
        let flushed: Result<(), _> = redis::cmd("FLUSHALL").query_async(&mut ctrl).await;
        if let Err(e) = flushed {
            warn!(plane = "control", error = %e, "broker_reset_failed");
        }

        if !self.shared_planes {
            let mut data = self.data.clone();
            let flushed: Result<(), _> = redis::cmd("FLUSHALL").query_async(&mut data).await;
            if let Err(e) = flushed {
                warn!(plane = "data", error = %e, "broker_reset_failed");
            }
        }

        self.groups.lock().clear();
        self.last_seen.lock().clear();
    }

    async fn publish(&self, channel: &str, payload: String) {
        let mut con = self.ctrl.clone();
        let sent: Result<i64, _> = con.publish(channel, payload).await;
        if let Err(e) = sent {
            warn!(channel = %channel, error = %e, "broker_publish_failed");
        }
    }

    fn to_config(&self) -> BrokerConfig {
        BrokerConfig {
            class_path: CLASS_PATH.to_string(),
            host: self.ctrl_host.clone(),
            port: self.ctrl_port,
            data_host: Some(self.data_host.clone()),
            data_port: Some(self.data_port),
            maxlen: self.maxlen,
            ttl_secs: self.ttl_secs,
        }
    }
}
