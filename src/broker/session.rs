//! Per-connection session state and the bounded outbound frame queue.

use super::{ClientId, ConnId};
use crate::mqtt::{Framer, Will};
use crate::ops::observability::BrokerMetrics;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Handle for a session's outbound byte queue.
///
/// Multi-producer (packet dispatch and router fan-out), single consumer (the
/// session's write pump). Enqueues never block: qos-0 deliveries are dropped
/// on overflow, anything else closes the session.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    close: Arc<watch::Sender<bool>>,
    next_mid: Arc<AtomicU16>,
    metrics: Arc<BrokerMetrics>,
}

impl Outbound {
    pub fn new(capacity: usize, metrics: Arc<BrokerMetrics>) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close, _) = watch::channel(false);
        let outbound = Self {
            tx,
            close: Arc::new(close),
            next_mid: Arc::new(AtomicU16::new(1)),
            metrics,
        };
        (outbound, rx)
    }

    /// Queue a frame that must reach the client (protocol responses, qos>0
    /// deliveries). On overflow the session is closed and `false` returned.
    pub fn send_required(&self, frame: Bytes) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.close();
                false
            }
        }
    }

    /// Queue a qos-0 delivery; dropped (and counted) on overflow.
    pub fn send_droppable(&self, frame: Bytes) {
        if self.tx.try_send(frame).is_err() {
            self.metrics.record_qos0_drop();
        }
    }

    /// Allocate a non-zero packet identifier for an outgoing qos-1 publish.
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.next_mid.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Signal the connection tasks to tear the session down.
    pub fn close(&self) {
        let _ = self.close.send(true);
    }

    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close.subscribe()
    }
}

struct SessionState {
    client_id: ClientId,
    connected: bool,
    clean_session: bool,
    keep_alive: u16,
    will: Option<Will>,
    last_activity: Instant,
}

/// One live client connection.
///
/// State fields are mutated only from the owning connection task; other tasks
/// interact through the outbound queue or the close signal.
pub struct Session {
    pub id: ConnId,
    pub transport: &'static str,
    pub peer: SocketAddr,
    state: Mutex<SessionState>,
    framer: Mutex<Framer>,
    outbound: Outbound,
}

impl Session {
    pub fn new(
        id: ConnId,
        transport: &'static str,
        peer: SocketAddr,
        outbound: Outbound,
        max_packet_size: usize,
        now: Instant,
    ) -> Self {
        Self {
            id,
            transport,
            peer,
            state: Mutex::new(SessionState {
                client_id: ClientId::default(),
                connected: false,
                clean_session: false,
                keep_alive: 0,
                will: None,
                last_activity: now,
            }),
            framer: Mutex::new(Framer::new(max_packet_size)),
            outbound,
        }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// Feed a raw chunk and collect every complete frame it yields.
    pub fn feed(&self, chunk: &[u8]) -> Result<Vec<Bytes>, crate::mqtt::CodecError> {
        let mut framer = self.framer.lock();
        framer.push(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = framer.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn record_activity(&self, now: Instant) {
        self.state.lock().last_activity = now;
    }

    /// True once the inbound silence exceeds `keep_alive * 1.5` seconds.
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if !state.connected || state.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_secs(u64::from(state.keep_alive)) * 3 / 2;
        now.saturating_duration_since(state.last_activity) > timeout
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn client_id(&self) -> ClientId {
        self.state.lock().client_id.clone()
    }

    pub fn clean_session(&self) -> bool {
        self.state.lock().clean_session
    }

    /// Populate session fields after a successful CONNECT.
    pub fn apply_connect(
        &self,
        client_id: ClientId,
        clean_session: bool,
        keep_alive: u16,
        will: Option<Will>,
    ) {
        let mut state = self.state.lock();
        state.client_id = client_id;
        state.clean_session = clean_session;
        state.keep_alive = keep_alive;
        state.will = will;
        state.connected = true;
    }

    /// Graceful DISCONNECT suppresses will publication.
    pub fn clear_will(&self) {
        self.state.lock().will = None;
    }

    pub fn take_will(&self) -> Option<Will> {
        self.state.lock().will.take()
    }
}
