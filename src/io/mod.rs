//! IO modules - network adapters between nodes and the outside
//!
//! - `handlers` - output adapters (broker publish, TCP push to a gateway)
//! - `tcp_ingress` - the gateway's fan-in TCP server
//! - `web` - the gateway's HTTP/MJPEG/WebSocket interface

pub mod handlers;
pub mod tcp_ingress;
pub mod web;

pub use handlers::{BrokerHandler, OutputHandler, TcpHandler};
pub use tcp_ingress::run_tcp_ingress;
pub use web::WebInterface;
