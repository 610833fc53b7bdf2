//! Broker-wide counters. Plain atomics so hot paths never contend on a lock.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    packets_received: AtomicU64,
    publishes_routed: AtomicU64,
    deliveries_enqueued: AtomicU64,
    qos0_dropped: AtomicU64,
    keepalive_timeouts: AtomicU64,
    protocol_errors: AtomicU64,
}

impl BrokerMetrics {
    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_routed(&self) {
        self.publishes_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.deliveries_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_qos0_drop(&self) {
        self.qos0_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive_timeout(&self) {
        self.keepalive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            publishes_routed: self.publishes_routed.load(Ordering::Relaxed),
            deliveries_enqueued: self.deliveries_enqueued.load(Ordering::Relaxed),
            qos0_dropped: self.qos0_dropped.load(Ordering::Relaxed),
            keepalive_timeouts: self.keepalive_timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub packets_received: u64,
    pub publishes_routed: u64,
    pub deliveries_enqueued: u64,
    pub qos0_dropped: u64,
    pub keepalive_timeouts: u64,
    pub protocol_errors: u64,
}
