//! Output handlers
//!
//! A node's run loop hands each produced frame to every installed handler in
//! order. Handlers are fire-and-forget: a failing handler logs and leaves
//! the others untouched, and never propagates an error into the loop.

use crate::domain::frame::Frame;
use crate::infra::broker::DynBroker;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connect timeout for the gateway push path. Short so a down gateway never
/// stalls a producer loop.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[async_trait]
pub trait OutputHandler: Send + Sync {
    /// Deliver one frame. The frame is mutable so transport handlers can
    /// stamp routing metadata before encoding.
    async fn send(&mut self, frame: &mut Frame);

    /// Human-readable destination for logs
    fn target(&self) -> String;
}

/// Publishes frames to a broker topic, trimming the topic to `queue_size`
/// after each publish (0 disables trimming).
pub struct BrokerHandler {
    broker: DynBroker,
    topic: String,
    queue_size: usize,
}

impl BrokerHandler {
    pub fn new(broker: DynBroker, topic: &str, queue_size: usize) -> Self {
        Self { broker, topic: topic.to_string(), queue_size }
    }
}

#[async_trait]
impl OutputHandler for BrokerHandler {
    async fn send(&mut self, frame: &mut Frame) {
        self.broker.push(&self.topic, frame.encode()).await;
        if self.queue_size > 0 {
            self.broker.trim(&self.topic, self.queue_size).await;
        }
    }

    fn target(&self) -> String {
        format!("broker:{}", self.topic)
    }
}

/// Pushes length-prefixed frames over TCP to a gateway.
///
/// The socket is lazy: a failed connect or write drops it and the next
/// `send` reconnects. Frames sent while the gateway is down are silently
/// lost - the caller is never blocked longer than the connect timeout.
pub struct TcpHandler {
    host: String,
    port: u16,
    source_id: String,
    stream: Option<TcpStream>,
}

impl TcpHandler {
    pub fn new(host: &str, port: u16, source_id: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            source_id: source_id.to_string(),
            stream: None,
        }
    }

    async fn connect(&mut self) {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(addr = %addr, error = %e, "tcp_nodelay_failed");
                }
                debug!(addr = %addr, source = %self.source_id, "tcp_handler_connected");
                self.stream = Some(stream);
            }
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "tcp_handler_connect_failed");
                self.stream = None;
            }
            Err(_) => {
                debug!(addr = %addr, "tcp_handler_connect_timeout");
                self.stream = None;
            }
        }
    }

    /// Frame bytes on the wire: `u32_be(len) ‖ body`
    fn packet(body: &Bytes) -> Bytes {
        let mut packet = Vec::with_capacity(4 + body.len());
        packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
        packet.extend_from_slice(body);
        Bytes::from(packet)
    }
}

#[async_trait]
impl OutputHandler for TcpHandler {
    async fn send(&mut self, frame: &mut Frame) {
        if self.stream.is_none() {
            self.connect().await;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        // Tag the producing edge so the gateway can route by topic
        frame.set_topic(&self.source_id);
        let packet = Self::packet(&frame.encode());

        if let Err(e) = stream.write_all(&packet).await {
            debug!(source = %self.source_id, error = %e, "tcp_handler_write_failed");
            self.stream = None;
        }
    }

    fn target(&self) -> String {
        format!("tcp:{}:{}@{}", self.host, self.port, self.source_id)
    }
}
