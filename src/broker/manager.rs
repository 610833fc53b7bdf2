//! Session manager: owns the set of live sessions, validates CONNECT,
//! dispatches decoded packets, enforces keep-alive, and runs the will/cleanup
//! path shared by every kind of disconnect.

use super::router::{valid_filter, Router};
use super::session::{Outbound, Session};
use super::{ClientId, ConnId, Message};
use crate::core::config::LimitsConfig;
use crate::core::time::Clock;
use crate::mqtt::{
    decode_packet, encode_connack, encode_pingresp, encode_puback, encode_suback, ConnectPacket,
    ConnectReturnCode, Packet, PublishPacket, QoS, SubscribePacket, SUBACK_FAILURE,
};
use crate::net::Connection;
use crate::ops::observability::BrokerMetrics;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionManager<C: Clock> {
    clock: C,
    router: Arc<Router>,
    metrics: Arc<BrokerMetrics>,
    sessions: RwLock<HashMap<ConnId, Arc<Session>>>,
    /// Connected client-id -> live connection, for session takeover.
    by_client: RwLock<HashMap<ClientId, ConnId>>,
    next_conn_id: AtomicU64,
    queue_capacity: usize,
    max_packet_size: usize,
}

impl<C: Clock> SessionManager<C> {
    pub fn new(clock: C, metrics: Arc<BrokerMetrics>, limits: &LimitsConfig) -> Self {
        Self {
            clock,
            router: Arc::new(Router::new(metrics.clone())),
            metrics,
            sessions: RwLock::new(HashMap::new()),
            by_client: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            queue_capacity: limits.outbound_queue_capacity,
            max_packet_size: limits.max_packet_size,
        }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Register a freshly accepted transport connection and spawn its write
    /// pump. Returns the connection handle plus the close signal the read
    /// loop must watch.
    pub fn on_open<W: Connection>(
        &self,
        writer: W,
        transport: &'static str,
    ) -> (ConnId, watch::Receiver<bool>) {
        let id = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let peer = writer.remote_addr();
        let (outbound, mut rx) = Outbound::new(self.queue_capacity, self.metrics.clone());
        let close_rx = outbound.close_signal();
        let session = Arc::new(Session::new(
            id,
            transport,
            peer,
            outbound,
            self.max_packet_size,
            self.clock.now(),
        ));
        self.sessions.write().insert(id, session);
        self.metrics.record_connection_opened();
        info!(conn = %id, peer = %peer, transport, "client connected");

        // Write pump: drains the outbound queue onto the transport. The
        // channel closes once every queue handle is gone (session removed
        // from the manager and the router), so queued responses still flush
        // before the socket shuts down.
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(frame) = rx.recv().await {
                if let Err(err) = writer.write(frame).await {
                    debug!(conn = %id, %err, "transport write failed");
                    break;
                }
            }
            writer.close().await;
        });

        (id, close_rx)
    }

    /// Feed raw transport bytes: frame, decode, dispatch.
    pub fn on_bytes(&self, id: ConnId, chunk: &[u8]) {
        let Some(session) = self.sessions.read().get(&id).cloned() else {
            return;
        };
        session.record_activity(self.clock.now());
        let frames = match session.feed(chunk) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(conn = %id, %err, "framing error, closing connection");
                self.metrics.record_protocol_error();
                self.close_session(id);
                return;
            }
        };
        for frame in frames {
            match decode_packet(&frame) {
                Ok(packet) => {
                    self.metrics.record_packet();
                    self.dispatch(&session, packet);
                }
                Err(err) => {
                    warn!(conn = %id, %err, "decode error, closing connection");
                    self.metrics.record_protocol_error();
                    self.close_session(id);
                    return;
                }
            }
            // A handler may have torn the session down; stop processing
            // queued frames for it.
            if !self.sessions.read().contains_key(&id) {
                return;
            }
        }
    }

    /// Transport-initiated close (read error, EOF, or close signal).
    pub fn on_close(&self, id: ConnId) {
        self.close_session(id);
    }

    /// Keep-alive sweep, invoked periodically by the server.
    pub fn tick(&self) {
        let now = self.clock.now();
        let expired: Vec<ConnId> = self
            .sessions
            .read()
            .values()
            .filter(|session| session.keep_alive_expired(now))
            .map(|session| session.id)
            .collect();
        for id in expired {
            warn!(conn = %id, "keep-alive expired, closing connection");
            self.metrics.record_keepalive_timeout();
            self.close_session(id);
        }
    }

    /// Orderly server shutdown: close every session with wills suppressed.
    pub fn shutdown(&self) {
        let ids: Vec<ConnId> = self.sessions.read().keys().copied().collect();
        for id in ids {
            if let Some(session) = self.sessions.read().get(&id).cloned() {
                session.clear_will();
            }
            self.close_session(id);
        }
    }

    fn dispatch(&self, session: &Arc<Session>, packet: Packet) {
        match packet {
            Packet::Connect(connect) => self.handle_connect(session, connect),
            Packet::Publish(_)
            | Packet::Puback(_)
            | Packet::Subscribe(_)
            | Packet::Pingreq
            | Packet::Disconnect
                if !session.is_connected() =>
            {
                warn!(conn = %session.id, "packet before CONNECT, closing connection");
                self.metrics.record_protocol_error();
                self.close_session(session.id);
            }
            Packet::Publish(publish) => self.handle_publish(session, publish),
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe),
            Packet::Pingreq => {
                session.outbound().send_required(encode_pingresp());
            }
            Packet::Puback(packet_id) => {
                // Subscriber acknowledged a qos-1 delivery. The core does not
                // retransmit, so this only refreshed activity.
                debug!(conn = %session.id, packet_id, "puback received");
            }
            Packet::Disconnect => {
                // Graceful disconnect suppresses the will (MQTT 3.1.1 §3.14).
                debug!(conn = %session.id, client_id = %session.client_id(), "graceful disconnect");
                session.clear_will();
                self.close_session(session.id);
            }
            other @ (Packet::Connack(_) | Packet::Suback(_) | Packet::Pingresp) => {
                warn!(conn = %session.id, kind = other.kind(), "server-only packet from client, closing connection");
                self.metrics.record_protocol_error();
                self.close_session(session.id);
            }
        }
    }

    fn handle_connect(&self, session: &Arc<Session>, connect: ConnectPacket) {
        if session.is_connected() {
            warn!(conn = %session.id, "second CONNECT on live session, closing connection");
            self.metrics.record_protocol_error();
            self.close_session(session.id);
            return;
        }
        if connect.protocol_name.as_ref() != b"MQTT" || connect.protocol_level != 4 {
            warn!(
                conn = %session.id,
                protocol = %String::from_utf8_lossy(&connect.protocol_name),
                level = connect.protocol_level,
                "unacceptable protocol version"
            );
            session.outbound().send_required(encode_connack(
                false,
                ConnectReturnCode::UNACCEPTABLE_PROTOCOL_VERSION,
            ));
            self.close_session(session.id);
            return;
        }
        let client_id = if connect.client_id.is_empty() {
            if !connect.clean_session {
                session
                    .outbound()
                    .send_required(encode_connack(false, ConnectReturnCode::IDENTIFIER_REJECTED));
                self.close_session(session.id);
                return;
            }
            let generated = format!("auto-{}", Uuid::new_v4());
            debug!(conn = %session.id, assigned = %generated, "assigned client identifier");
            ClientId::new(Bytes::from(generated.into_bytes()))
        } else {
            ClientId::new(connect.client_id.clone())
        };

        // MQTT 3.1.4: a second connection with the same client identifier
        // evicts the first one through the regular non-graceful path.
        let prior = self.by_client.read().get(&client_id).copied();
        if let Some(old_id) = prior {
            info!(client_id = %client_id, old = %old_id, new = %session.id, "session taken over");
            self.close_session(old_id);
        }

        if let Some(username) = &connect.username {
            // Credential policy is delegated; the broker only records that
            // credentials were presented.
            debug!(conn = %session.id, username = %String::from_utf8_lossy(username), "credentials presented");
        }

        session.apply_connect(
            client_id.clone(),
            connect.clean_session,
            connect.keep_alive,
            connect.will,
        );
        self.by_client.write().insert(client_id.clone(), session.id);
        self.router
            .register(client_id.clone(), session.outbound().clone());
        session
            .outbound()
            .send_required(encode_connack(false, ConnectReturnCode::ACCEPTED));
        info!(
            conn = %session.id,
            client_id = %client_id,
            clean_session = connect.clean_session,
            keep_alive = connect.keep_alive,
            "session established"
        );
    }

    fn handle_publish(&self, session: &Arc<Session>, publish: PublishPacket) {
        let qos = if publish.qos == QoS::ExactlyOnce {
            // Exactly-once is outside the core; downgraded consistently.
            warn!(
                conn = %session.id,
                topic = %String::from_utf8_lossy(&publish.topic),
                "qos 2 publish downgraded to qos 1"
            );
            QoS::AtLeastOnce
        } else {
            publish.qos
        };
        self.router.route(&Message {
            topic: publish.topic,
            payload: publish.payload,
            qos,
            retain: publish.retain,
        });
        if qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                session.outbound().send_required(encode_puback(packet_id));
            }
        }
    }

    fn handle_subscribe(&self, session: &Arc<Session>, subscribe: SubscribePacket) {
        let client_id = session.client_id();
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut accepted = Vec::with_capacity(subscribe.filters.len());
        for request in subscribe.filters {
            if !valid_filter(&request.filter) {
                debug!(
                    conn = %session.id,
                    filter = %String::from_utf8_lossy(&request.filter),
                    "rejected malformed topic filter"
                );
                return_codes.push(SUBACK_FAILURE);
                continue;
            }
            // The broker delivers qos 0 and 1 only.
            let granted = request.qos.min(QoS::AtLeastOnce);
            self.router
                .subscribe(client_id.clone(), request.filter.clone(), granted);
            return_codes.push(granted.bits());
            accepted.push((request.filter, granted));
        }
        match encode_suback(subscribe.packet_id, &return_codes) {
            Ok(frame) => {
                if !session.outbound().send_required(frame) {
                    return;
                }
            }
            Err(err) => {
                warn!(conn = %session.id, %err, "failed to encode SUBACK, closing connection");
                self.close_session(session.id);
                return;
            }
        }
        // Retained deliveries follow the SUBACK.
        self.router.send_retained(&client_id, &accepted);
    }

    /// Single teardown path shared by transport close, keep-alive expiry,
    /// protocol violations, takeover, and graceful disconnect.
    fn close_session(&self, id: ConnId) {
        let Some(session) = self.sessions.write().remove(&id) else {
            return;
        };
        session.outbound().close();
        if session.is_connected() {
            let client_id = session.client_id();
            self.router.unsubscribe_all(&client_id);
            self.router.deregister(&client_id);
            let mut by_client = self.by_client.write();
            if by_client.get(&client_id) == Some(&id) {
                by_client.remove(&client_id);
            }
            drop(by_client);
            if let Some(will) = session.take_will() {
                info!(
                    client_id = %client_id,
                    topic = %String::from_utf8_lossy(&will.topic),
                    "publishing will"
                );
                self.router.route(&Message {
                    topic: will.topic,
                    payload: will.payload,
                    qos: will.qos,
                    retain: will.retain,
                });
            }
            info!(conn = %id, client_id = %client_id, "client disconnected");
        } else {
            info!(conn = %id, "connection closed before CONNECT completed");
        }
        self.metrics.record_connection_closed();
    }
}
