//! Web interface for the gateway
//!
//! Serves the external faces of a running graph:
//! - `GET /dashboard` (and `/`) - live HTML dashboard
//! - `GET /video` / `GET /video/{topic}` - multipart MJPEG streams
//! - `GET /api/fps` - per-topic frames/second
//! - `GET /api/resources` - per-topic jitter-buffer and broker-queue depth
//! - `GET /api/status` - last-seen metadata per topic
//! - `WS /ws/stats` - ~10 Hz push of the union of the above
//! - `GET /health` - liveness
//!
//! One jitter buffer per topic smooths fan-in arrival order before MJPEG
//! playback. All mutable state sits behind a single async lock.

use crate::domain::frame::Frame;
use crate::services::gateway::{GatewayContext, Interface};
use crate::services::jitter::TimeJitterBuffer;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Frame as BodyFrame;
use hyper::header::{CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Stats push cadence for `/ws/stats`
const STATS_INTERVAL: Duration = Duration::from_millis(100);

/// MJPEG part boundary
const BOUNDARY: &str = "frameboundary";

type ResponseBody = BoxBody<Bytes, Infallible>;

/// Per-topic state behind the interface's single async lock.
struct WebShared {
    buffer_delay: f64,
    buffers: HashMap<String, TimeJitterBuffer>,
    latest_meta: HashMap<String, Map<String, Value>>,
    frame_counts: HashMap<String, u64>,
    fps_stats: HashMap<String, f64>,
    last_fps_calc: Instant,
}

impl WebShared {
    fn new(buffer_delay: f64) -> Self {
        Self {
            buffer_delay,
            buffers: HashMap::new(),
            latest_meta: HashMap::new(),
            frame_counts: HashMap::new(),
            fps_stats: HashMap::new(),
            last_fps_calc: Instant::now(),
        }
    }

    fn ingest(&mut self, frame: &Frame) {
        let topic = frame.topic().unwrap_or("default").to_string();

        if !self.buffers.contains_key(&topic) {
            info!(topic = %topic, "web_new_topic");
        }
        let delay = self.buffer_delay;
        self.buffers
            .entry(topic.clone())
            .or_insert_with(|| TimeJitterBuffer::new(delay))
            .push(frame.timestamp, frame.payload.clone());

        *self.frame_counts.entry(topic.clone()).or_insert(0) += 1;

        if !frame.meta.is_empty() {
            let meta = self.latest_meta.entry(topic).or_default();
            for (key, value) in &frame.meta {
                meta.insert(key.clone(), value.clone());
            }
        }
    }

    /// Recompute per-topic fps once a second; between computations the last
    /// values are returned. Topics without a computed rate yet show 0.0 so
    /// clients can render their cards immediately.
    fn calc_fps(&mut self) -> HashMap<String, f64> {
        for topic in self.buffers.keys() {
            self.fps_stats.entry(topic.clone()).or_insert(0.0);
        }

        let elapsed = self.last_fps_calc.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            for (topic, count) in self.frame_counts.drain() {
                self.fps_stats
                    .insert(topic, (count as f64 / elapsed * 100.0).round() / 100.0);
            }
            self.last_fps_calc = Instant::now();
        }
        self.fps_stats.clone()
    }
}

struct WebInner {
    port: u16,
    shared: Mutex<WebShared>,
    stats_tx: broadcast::Sender<String>,
}

/// The primary gateway interface: HTTP + MJPEG + WebSocket stats.
#[derive(Clone)]
pub struct WebInterface {
    inner: Arc<WebInner>,
}

impl WebInterface {
    pub fn new(port: u16, buffer_delay: f64) -> Self {
        let (stats_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(WebInner {
                port,
                shared: Mutex::new(WebShared::new(buffer_delay)),
                stats_tx,
            }),
        }
    }
}

#[async_trait]
impl Interface for WebInterface {
    async fn setup(&self, _ctx: &GatewayContext) {
        info!(port = %self.inner.port, "web_interface_prepared");
    }

    async fn on_frame(&self, frame: &Frame) {
        self.inner.shared.lock().await.ingest(frame);
    }

    async fn run_loop(&self, ctx: GatewayContext, mut shutdown: watch::Receiver<bool>) {
        // Stats broadcaster: push the union of fps/resources/status/nodes
        // to every connected WebSocket client.
        {
            let inner = self.inner.clone();
            let ctx = ctx.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if inner.stats_tx.receiver_count() == 0 {
                                continue;
                            }
                            let stats = collect_stats(&inner, &ctx).await;
                            let _ = inner.stats_tx.send(stats.to_string());
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.inner.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = %self.inner.port, error = %e, "web_bind_failed");
                return;
            }
        };
        info!(port = %self.inner.port, "web_interface_listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let io = TokioIo::new(stream);
                            let inner = self.inner.clone();
                            let ctx = ctx.clone();

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    handle_request(req, inner.clone(), ctx.clone())
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!(error = %e, "web_connection_error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "web_accept_failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("web_interface_shutdown");
                        return;
                    }
                }
            }
        }
    }
}

/// Union of everything the JSON endpoints expose, pushed over `/ws/stats`.
async fn collect_stats(inner: &Arc<WebInner>, ctx: &GatewayContext) -> Value {
    let queues = ctx.broker.queue_stats().await;

    let (fps, buffers, status) = {
        let mut shared = inner.shared.lock().await;
        let fps = shared.calc_fps();
        let buffers: HashMap<String, (usize, usize)> = shared
            .buffers
            .iter()
            .map(|(topic, buf)| (topic.clone(), (buf.len(), buf.max_size())))
            .collect();
        (fps, buffers, shared.latest_meta.clone())
    };

    let mut resources = Map::new();
    for topic in buffers.keys().chain(queues.keys()) {
        if resources.contains_key(topic) {
            continue;
        }
        let (buf_current, buf_max) = buffers.get(topic).copied().unwrap_or((0, 0));
        let queue = queues.get(topic);
        resources.insert(
            topic.clone(),
            json!({
                "buffer": {"current": buf_current, "max": buf_max},
                "queue": {
                    "current": queue.map(|q| q.current).unwrap_or(0),
                    "max": queue.map(|q| q.max).unwrap_or(0),
                },
            }),
        );
    }

    let nodes: Map<String, Value> = ctx
        .node_reports
        .lock()
        .iter()
        .map(|(name, report)| {
            (name.clone(), serde_json::to_value(report).unwrap_or(Value::Null))
        })
        .collect();

    json!({
        "fps": fps,
        "resources": resources,
        "status": status,
        "nodes": nodes,
    })
}

async fn handle_request(
    mut req: Request<hyper::body::Incoming>,
    inner: Arc<WebInner>,
    ctx: GatewayContext,
) -> Result<Response<ResponseBody>, Infallible> {
    let path = req.uri().path().to_string();

    // WebSocket upgrade needs the request by value; handle it before the
    // read-only routing below
    if req.method() == Method::GET && path == "/ws/stats" {
        return Ok(upgrade_websocket(&mut req, inner));
    }

    match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => Ok(json_response(json!({"status": "ok"}))),

        (&Method::GET, "/") => Ok(Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header("Location", "/dashboard")
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()))),

        (&Method::GET, "/dashboard") => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full_body(Bytes::from_static(DASHBOARD_HTML.as_bytes())))
            .unwrap_or_else(|_| Response::new(empty_body()))),

        (&Method::GET, "/api/fps") => {
            let fps = inner.shared.lock().await.calc_fps();
            Ok(json_response(serde_json::to_value(fps).unwrap_or(Value::Null)))
        }

        (&Method::GET, "/api/resources") => {
            let stats = collect_stats(&inner, &ctx).await;
            Ok(json_response(stats.get("resources").cloned().unwrap_or(Value::Null)))
        }

        (&Method::GET, "/api/status") => {
            let status = inner.shared.lock().await.latest_meta.clone();
            Ok(json_response(serde_json::to_value(status).unwrap_or(Value::Null)))
        }

        (&Method::GET, "/video") => Ok(mjpeg_response(inner, "default")),

        (&Method::GET, path) if path.starts_with("/video/") => {
            let topic = path.trim_start_matches("/video/").to_string();
            Ok(mjpeg_response(inner, &topic))
        }

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(Bytes::from_static(b"Not Found")))
            .unwrap_or_else(|_| Response::new(empty_body()))),
    }
}

fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes).boxed()
}

fn empty_body() -> ResponseBody {
    full_body(Bytes::new())
}

fn json_response(value: Value) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(Bytes::from(value.to_string())))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Streaming body fed by the per-client MJPEG task. Ends when the feeder
/// drops its sender.
struct MjpegBody {
    rx: mpsc::Receiver<Bytes>,
}

impl hyper::body::Body for MjpegBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BodyFrame<Bytes>, Infallible>>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(BodyFrame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Multipart MJPEG: a per-client task pops the topic's jitter buffer and
/// emits one JPEG part per payload until the client goes away.
fn mjpeg_response(inner: Arc<WebInner>, topic: &str) -> Response<ResponseBody> {
    info!(topic = %topic, "web_stream_started");
    let topic = topic.to_string();
    let (tx, rx) = mpsc::channel::<Bytes>(8);

    tokio::spawn(async move {
        loop {
            if tx.is_closed() {
                break;
            }

            let (data, delay) = {
                let mut shared = inner.shared.lock().await;
                let delay = shared.buffer_delay;
                (shared.buffers.get_mut(&topic).and_then(TimeJitterBuffer::pop), delay)
            };

            match data {
                Some(payload) => {
                    let mut part = BytesMut::with_capacity(payload.len() + 64);
                    part.extend_from_slice(
                        format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n").as_bytes(),
                    );
                    part.extend_from_slice(&payload);
                    part.extend_from_slice(b"\r\n");

                    if tx.send(part.freeze()).await.is_err() {
                        break;
                    }
                    // Pace playback: near-immediate when undelayed, gentle
                    // when a jitter window is configured
                    let wait = if delay == 0.0 { 1 } else { 10 };
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        debug!(topic = %topic, "web_stream_stopped");
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
        )
        .body(MjpegBody { rx }.boxed())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// Complete the WebSocket handshake and hand the connection to the stats
/// feeder. The HTTP 101 goes out first; the upgraded stream is claimed in a
/// background task once hyper releases it.
fn upgrade_websocket(
    req: &mut Request<hyper::body::Incoming>,
    inner: Arc<WebInner>,
) -> Response<ResponseBody> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body(Bytes::from_static(b"missing Sec-WebSocket-Key")))
            .unwrap_or_else(|_| Response::new(empty_body()));
    };
    let accept_key = derive_accept_key(key.as_bytes());

    let stats_rx = inner.stats_tx.subscribe();
    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                serve_ws_client(ws, stats_rx).await;
            }
            Err(e) => {
                warn!(error = %e, "ws_upgrade_failed");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(empty_body())
        .unwrap_or_else(|_| Response::new(empty_body()))
}

async fn serve_ws_client(
    mut ws: WebSocketStream<TokioIo<Upgraded>>,
    mut stats_rx: broadcast::Receiver<String>,
) {
    info!("ws_client_connected");
    loop {
        tokio::select! {
            stats = stats_rx.recv() => {
                match stats {
                    Ok(json) => {
                        if ws.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = ws.next() => {
                match incoming {
                    // Clients may ping or send keep-alive text; only a close
                    // (or error) ends the session
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    info!("ws_client_disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tagged_frame(topic: &str, ts: f64, payload: &'static [u8]) -> Frame {
        let mut frame = Frame::with_parts(0, ts, Map::new(), Bytes::from_static(payload));
        frame.set_topic(topic);
        frame.meta.insert("score".to_string(), json!(0.9));
        frame
    }

    #[test]
    fn test_ingest_buckets_by_topic() {
        let mut shared = WebShared::new(0.0);
        shared.ingest(&tagged_frame("cam", 1.0, b"a"));
        shared.ingest(&tagged_frame("cam", 2.0, b"b"));
        shared.ingest(&tagged_frame("yolo", 1.5, b"c"));

        assert_eq!(shared.buffers.get("cam").unwrap().len(), 2);
        assert_eq!(shared.buffers.get("yolo").unwrap().len(), 1);
        assert_eq!(shared.frame_counts["cam"], 2);
        assert_eq!(shared.frame_counts["yolo"], 1);
        assert_eq!(shared.latest_meta["cam"]["score"], json!(0.9));
        assert_eq!(shared.latest_meta["cam"]["topic"], json!("cam"));
    }

    #[test]
    fn test_ingest_untagged_frame_lands_on_default() {
        let mut shared = WebShared::new(0.0);
        let frame = Frame::with_parts(0, 1.0, Map::new(), Bytes::from_static(b"x"));
        shared.ingest(&frame);
        assert_eq!(shared.buffers.get("default").unwrap().len(), 1);
    }

    #[test]
    fn test_calc_fps_shows_known_topics_before_first_window() {
        let mut shared = WebShared::new(0.0);
        shared.ingest(&tagged_frame("cam", 1.0, b"a"));

        // First call happens inside the one-second window: the topic is
        // present with a zero rate rather than absent
        let fps = shared.calc_fps();
        assert_eq!(fps.get("cam"), Some(&0.0));
    }

    #[test]
    fn test_calc_fps_computes_after_window() {
        let mut shared = WebShared::new(0.0);
        for _ in 0..30 {
            shared.ingest(&tagged_frame("cam", 1.0, b"a"));
        }
        shared.last_fps_calc = Instant::now() - Duration::from_secs(2);

        let fps = shared.calc_fps();
        let rate = fps["cam"];
        assert!(rate > 10.0 && rate < 20.0, "30 frames / ~2s, got {rate}");
        // Counters reset for the next window
        assert!(shared.frame_counts.is_empty());
    }

    #[test]
    fn test_dashboard_references_live_endpoints() {
        assert!(DASHBOARD_HTML.contains("/ws/stats"));
        assert!(DASHBOARD_HTML.contains("/video/"));
    }
}

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>EdgeFlow</title>
<style>
  body { font-family: system-ui, sans-serif; margin: 0; background: #111; color: #eee; }
  header { padding: 12px 20px; background: #1b1b1b; border-bottom: 1px solid #333; }
  main { display: flex; flex-wrap: wrap; gap: 16px; padding: 20px; }
  .card { background: #1b1b1b; border: 1px solid #333; border-radius: 8px; padding: 12px; }
  .card img { max-width: 480px; display: block; border-radius: 4px; }
  .stat { font-size: 13px; color: #9a9a9a; margin-top: 8px; white-space: pre; }
</style>
</head>
<body>
<header><strong>EdgeFlow</strong> &mdash; live topics</header>
<main id="topics"></main>
<script>
  const main = document.getElementById('topics');
  const cards = {};
  function card(topic) {
    if (cards[topic]) return cards[topic];
    const el = document.createElement('div');
    el.className = 'card';
    el.innerHTML = '<div>' + topic + '</div>' +
      '<img src="/video/' + topic + '">' +
      '<div class="stat"></div>';
    main.appendChild(el);
    cards[topic] = el;
    return el;
  }
  const ws = new WebSocket('ws://' + location.host + '/ws/stats');
  ws.onmessage = (ev) => {
    const stats = JSON.parse(ev.data);
    for (const topic of Object.keys(stats.fps || {})) {
      const el = card(topic);
      const res = (stats.resources || {})[topic] || {};
      const buf = res.buffer || {}; const queue = res.queue || {};
      el.querySelector('.stat').textContent =
        'fps ' + stats.fps[topic] +
        '  buffer ' + (buf.current ?? 0) + '/' + (buf.max ?? 0) +
        '  queue ' + (queue.current ?? 0) + '/' + (queue.max ?? 0);
    }
  };
</script>
</body>
</html>
"#;
