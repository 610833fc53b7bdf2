//! Networking layer.
//!
//! The broker core consumes any byte-stream transport offering write, close,
//! and a remote-address accessor; the TCP listener is the bundled
//! implementation.

pub mod tcp;

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

/// Write side of one client connection, as seen by the session write pump.
pub trait Connection: Send + 'static {
    fn remote_addr(&self) -> SocketAddr;

    fn write(&mut self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub use tcp::TcpServer;
