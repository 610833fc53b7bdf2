//! TCP listener: accepts connections and shuttles bytes between sockets and
//! the session manager.

use super::Connection;
use crate::broker::SessionManager;
use crate::core::time::Clock;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub struct TcpConnection {
    writer: OwnedWriteHalf,
    peer: SocketAddr,
}

impl Connection for TcpConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn write(&mut self, frame: Bytes) -> io::Result<()> {
        self.writer.write_all(&frame).await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

pub struct TcpServer<C: Clock> {
    listener: TcpListener,
    manager: Arc<SessionManager<C>>,
}

impl<C: Clock> TcpServer<C> {
    pub async fn bind(addr: &str, manager: Arc<SessionManager<C>>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept loop. Runs until the enclosing task is dropped (server
    /// shutdown); per-connection failures never leave this loop.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "tcp accept error");
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, %err, "failed to disable nagle");
            }
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                handle_connection(manager, stream, peer).await;
            });
        }
    }
}

async fn handle_connection<C: Clock>(
    manager: Arc<SessionManager<C>>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (read_half, write_half) = stream.into_split();
    let conn = TcpConnection {
        writer: write_half,
        peer,
    };
    let (id, close_rx) = manager.on_open(conn, "tcp");
    read_loop(&manager, id, read_half, close_rx).await;
    manager.on_close(id);
    info!(conn = %id, %peer, "connection ended");
}

async fn read_loop<C: Clock>(
    manager: &SessionManager<C>,
    id: crate::broker::ConnId,
    mut read_half: OwnedReadHalf,
    mut close_rx: tokio::sync::watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => match result {
                Ok(0) => return,
                Ok(n) => manager.on_bytes(id, &buf[..n]),
                Err(err) => {
                    debug!(conn = %id, %err, "transport read failed");
                    return;
                }
            },
            _ = close_rx.changed() => return,
        }
    }
}
