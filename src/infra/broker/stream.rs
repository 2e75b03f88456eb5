//! Single-plane stream broker
//!
//! Control and data share one store: each control-stream entry carries the
//! full encoded frame in its `data` field. Streams are appended with an
//! approximate MAXLEN cap; consumer groups are created lazily from id `0`
//! so a late-joining group still sees retained history.

use super::{
    connect_with_backoff, Broker, BrokerConfig, QueueStats, DEFAULT_TTL_SECS, META_LIMIT_PREFIX,
};
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
use tracing::{debug, warn};

pub const CLASS_PATH: &str = "edgeflow::StreamBroker";

/// Stream-backed broker with consumer-group fan-out.
pub struct StreamBroker {
    host: String,
    port: u16,
    maxlen: usize,
    con: ConnectionManager,
    /// `(topic, group)` pairs already created on the server
    groups: Mutex<FxHashSet<String>>,
    /// Per-topic control id last returned by `pop_latest` (REALTIME dedup)
    last_seen: Mutex<FxHashMap<String, String>>,
}

impl StreamBroker {
    pub async fn connect(host: &str, port: u16, maxlen: usize) -> Self {
        let con = connect_with_backoff(host, port, "control").await;
        Self {
            host: host.to_string(),
            port,
            maxlen,
            con,
            groups: Mutex::new(FxHashSet::default()),
            last_seen: Mutex::new(FxHashMap::default()),
        }
    }

    pub async fn from_config(config: &BrokerConfig) -> Self {
        Self::connect(&config.host, config.port, config.maxlen).await
    }

    async fn ensure_group(&self, topic: &str, group: &str) {
        let key = format!("{topic}:{group}");
        if self.groups.lock().contains(&key) {
            return;
        }

        let mut con = self.con.clone();
        // Start from 0 so retained history is delivered to late joiners
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

    /// One consumer-group read, acknowledged immediately. Returns the
    /// control id alongside the payload so BALANCED can measure lag.
    async fn group_read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
    ) -> Option<(String, Bytes)> {
        self.ensure_group(topic, group).await;

        let mut con = self.con.clone();
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

        entry_data(&entry).map(|data| (entry.id, data))
    }

    async fn tip(&self, topic: &str) -> Option<StreamId> {
        let mut con = self.con.clone();
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

fn entry_data(entry: &StreamId) -> Option<Bytes> {
    entry.get::<Vec<u8>>("data").map(Bytes::from)
}

#[async_trait]
impl Broker for StreamBroker {
    async fn push(&self, topic: &str, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut con = self.con.clone();
        let added: Result<String, _> = con
            .xadd_maxlen(
                topic,
                StreamMaxlen::Approx(self.maxlen),
                "*",
                &[("data", &data[..])],
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
        self.group_read(topic, group, consumer, timeout)
            .await
            .map(|(_, data)| data)
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
                    return entry_data(&entry);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            // Block until an entry newer than the tip arrives, then re-check
            let mut con = self.con.clone();
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
        let (id, data) = self.group_read(topic, group, consumer, timeout).await?;

        // How far behind the tip is this entry?
        let mut con = self.con.clone();
        let behind: StreamRangeReply = match con
            .xrange_count(topic, format!("({id}"), "+", skip_threshold + 1)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(topic = %topic, error = %e, "broker_lag_check_failed");
                return Some(data);
            }
        };

        if behind.ids.len() <= skip_threshold {
            return Some(data);
        }

        // Too far behind: fast-forward the group past everything retained
        // and hand back the tip entry instead.
        debug!(topic = %topic, group = %group, lag = %behind.ids.len(), "broker_balanced_skip");
        let forwarded: Result<(), _> = con.xgroup_setid(topic, group, "$").await;
        if let Err(e) = forwarded {
            warn!(topic = %topic, group = %group, error = %e, "broker_setid_failed");
        }
        match self.tip(topic).await {
            Some(tip) => entry_data(&tip),
            None => Some(data),
        }
    }

    async fn trim(&self, topic: &str, size: usize) {
        let mut con = self.con.clone();
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
        let mut con = self.con.clone();
        con.xlen(topic).await.unwrap_or(0)
    }

    async fn queue_stats(&self) -> HashMap<String, QueueStats> {
        let mut stats = HashMap::new();
        let mut con = self.con.clone();

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
        let mut con = self.con.clone();
        let flushed: Result<(), _> = redis::cmd("FLUSHALL").query_async(&mut con).await;
        if let Err(e) = flushed {
            warn!(error = %e, "broker_reset_failed");
        }
        self.groups.lock().clear();
        self.last_seen.lock().clear();
    }

    async fn publish(&self, channel: &str, payload: String) {
        let mut con = self.con.clone();
        let sent: Result<i64, _> = con.publish(channel, payload).await;
        if let Err(e) = sent {
            warn!(channel = %channel, error = %e, "broker_publish_failed");
        }
    }

    fn to_config(&self) -> BrokerConfig {
        BrokerConfig {
            class_path: CLASS_PATH.to_string(),
            host: self.host.clone(),
            port: self.port,
            data_host: None,
            data_port: None,
            maxlen: self.maxlen,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}
