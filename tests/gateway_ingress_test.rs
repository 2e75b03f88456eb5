//! End-to-end test of the gateway fan-in path: TcpHandler framing on one
//! side, the ingress server and interface broadcast on the other.

use async_trait::async_trait;
use bytes::Bytes;
use edgeflow::domain::Frame;
use edgeflow::io::handlers::{OutputHandler, TcpHandler};
use edgeflow::io::tcp_ingress::run_tcp_ingress;
use edgeflow::services::gateway::GatewayContext;
use edgeflow::Interface;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Interface that records everything it sees.
struct CaptureInterface {
    frames: Mutex<Vec<Frame>>,
}

#[async_trait]
impl Interface for CaptureInterface {
    async fn setup(&self, _ctx: &GatewayContext) {}

    async fn on_frame(&self, frame: &Frame) {
        self.frames.lock().push(frame.clone());
    }

    async fn run_loop(&self, _ctx: GatewayContext, _shutdown: watch::Receiver<bool>) {}
}

async fn wait_for_frames(capture: &CaptureInterface, count: usize) -> bool {
    for _ in 0..100 {
        if capture.frames.lock().len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_fan_in_from_two_sources() {
    let port = 38491;
    let capture = Arc::new(CaptureInterface { frames: Mutex::new(Vec::new()) });
    let interfaces: Arc<Vec<Arc<dyn Interface>>> = Arc::new(vec![capture.clone() as Arc<dyn Interface>]);
    let active_clients = Arc::new(Mutex::new(HashSet::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_tcp_ingress(
        port,
        interfaces,
        active_clients.clone(),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Two upstream nodes with distinct channel labels
    let mut cam = TcpHandler::new("127.0.0.1", port, "cam");
    let mut yolo = TcpHandler::new("127.0.0.1", port, "yolo");

    let mut cam_frame = Frame::new(1, Bytes::from_static(b"cam-jpeg"));
    let mut yolo_frame = Frame::new(2, Bytes::from_static(b"yolo-jpeg"));
    cam.send(&mut cam_frame).await;
    yolo.send(&mut yolo_frame).await;

    assert!(wait_for_frames(&capture, 2).await, "frames did not arrive");
    assert_eq!(active_clients.lock().len(), 2);

    let frames = capture.frames.lock();
    let topics: HashSet<_> = frames.iter().filter_map(|f| f.topic().map(str::to_string)).collect();
    assert!(topics.contains("cam"));
    assert!(topics.contains("yolo"));

    // Every arriving frame is stamped on the way in
    for frame in frames.iter() {
        assert!(frame.latency_ms().is_some(), "missing gateway_in stamp");
        assert!(!frame.payload.is_empty());
    }
    drop(frames);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[tokio::test]
async fn test_malformed_frame_closes_connection_cleanly() {
    let port = 38492;
    let capture = Arc::new(CaptureInterface { frames: Mutex::new(Vec::new()) });
    let interfaces: Arc<Vec<Arc<dyn Interface>>> = Arc::new(vec![capture.clone() as Arc<dyn Interface>]);
    let active_clients = Arc::new(Mutex::new(HashSet::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(run_tcp_ingress(
        port,
        interfaces,
        active_clients.clone(),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Hand-roll a packet whose body is too short to be a frame
    use tokio::io::AsyncWriteExt;
    let mut socket = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let junk = [0u8; 8];
    socket.write_all(&(junk.len() as u32).to_be_bytes()).await.unwrap();
    socket.write_all(&junk).await.unwrap();

    // The server drops the client without crashing; a well-formed frame on
    // a new connection still goes through
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(capture.frames.lock().is_empty());

    let mut handler = TcpHandler::new("127.0.0.1", port, "cam");
    let mut frame = Frame::new(7, Bytes::from_static(b"ok"));
    handler.send(&mut frame).await;

    assert!(wait_for_frames(&capture, 1).await, "recovery frame did not arrive");
    assert_eq!(capture.frames.lock()[0].frame_id, 7);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}
