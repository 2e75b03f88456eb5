//! Gateway fan-in TCP server
//!
//! Accepts connections from upstream TCP handlers and reads length-prefixed
//! frames: `u32_be(len) ‖ encoded_frame`. Each decoded frame is stamped
//! `gateway_in` and broadcast to every registered interface concurrently.
//! Per-connection order is preserved; cross-connection order is not.

use crate::domain::frame::Frame;
use crate::services::gateway::Interface;
use bytes::BytesMut;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Upper bound on a single frame body; anything larger is a corrupt length
/// header and the connection is dropped.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub async fn run_tcp_ingress(
    port: u16,
    interfaces: Arc<Vec<Arc<dyn Interface>>>,
    active_clients: Arc<Mutex<HashSet<SocketAddr>>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(port = %port, "gateway_tcp_listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        active_clients.lock().insert(addr);
                        info!(peer = %addr, active = %active_clients.lock().len(), "gateway_client_connected");

                        let interfaces = interfaces.clone();
                        let active_clients = active_clients.clone();
                        tokio::spawn(async move {
                            handle_client(socket, addr, &interfaces).await;
                            active_clients.lock().remove(&addr);
                            info!(peer = %addr, active = %active_clients.lock().len(), "gateway_client_disconnected");
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "gateway_accept_failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("gateway_tcp_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(mut socket: TcpStream, addr: SocketAddr, interfaces: &[Arc<dyn Interface>]) {
    loop {
        let mut len_buf = [0u8; 4];
        if socket.read_exact(&mut len_buf).await.is_err() {
            // Short read: the peer went away mid-frame or closed
            return;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_BYTES {
            warn!(peer = %addr, len = %len, "gateway_frame_oversized");
            return;
        }

        let mut body = BytesMut::zeroed(len);
        if socket.read_exact(&mut body).await.is_err() {
            return;
        }

        // Zero-copy decode: the payload is re-emitted verbatim downstream
        let mut frame = match Frame::decode_shared(body.freeze()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = %addr, error = %e, "gateway_frame_malformed");
                return;
            }
        };
        frame.mark("gateway_in");

        debug!(
            peer = %addr,
            frame_id = %frame.frame_id,
            topic = %frame.topic().unwrap_or("default"),
            "gateway_frame_received"
        );

        join_all(interfaces.iter().map(|interface| interface.on_frame(&frame))).await;
    }
}
