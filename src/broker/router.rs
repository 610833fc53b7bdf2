//! Topic router: subscription table, wildcard matcher, retained-message
//! store, and fan-out onto per-client outbound queues.

use super::session::Outbound;
use super::{ClientId, Message};
use crate::mqtt::{encode_publish, QoS};
use crate::ops::observability::BrokerMetrics;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

const LEVEL_SEP: u8 = b'/';
const SINGLE: &[u8] = b"+";
const MULTI: &[u8] = b"#";

/// Check an MQTT topic name against a topic filter.
///
/// `+` matches exactly one level, a trailing `#` matches the remaining
/// levels (including none). Topics starting with `$` never match filters
/// whose first level is a wildcard.
pub fn topic_matches(topic: &[u8], filter: &[u8]) -> bool {
    if topic.first() == Some(&b'$') {
        if let Some(first) = filter.split(|&b| b == LEVEL_SEP).next() {
            if first == SINGLE || first == MULTI {
                return false;
            }
        }
    }
    let topic_levels: Vec<&[u8]> = topic.split(|&b| b == LEVEL_SEP).collect();
    let filter_levels: Vec<&[u8]> = filter.split(|&b| b == LEVEL_SEP).collect();

    let mut i = 0;
    while i < filter_levels.len() && i < topic_levels.len() {
        let level = filter_levels[i];
        if level == MULTI {
            return true;
        }
        if level != SINGLE && level != topic_levels[i] {
            return false;
        }
        i += 1;
    }
    if filter_levels.len() == topic_levels.len() {
        return true;
    }
    filter_levels.len() == topic_levels.len() + 1 && filter_levels[topic_levels.len()] == MULTI
}

/// Validate a subscription filter: `#` only as the final, whole level; `+`
/// only as a whole level; never mixed into a literal level.
pub fn valid_filter(filter: &[u8]) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&[u8]> = filter.split(|&b| b == LEVEL_SEP).collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if *level == MULTI {
            if i != last {
                return false;
            }
        } else if *level != SINGLE && (level.contains(&b'#') || level.contains(&b'+')) {
            return false;
        }
    }
    true
}

/// The last retained publish on one exact topic. Never stored with an empty
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub payload: Bytes,
    pub qos: QoS,
}

#[derive(Default)]
struct RouterState {
    /// filter -> client -> granted qos.
    subscriptions: HashMap<Bytes, HashMap<ClientId, QoS>>,
    /// Deterministic iteration order keeps retained scans stable.
    retained: BTreeMap<Bytes, RetainedMessage>,
    /// Outbound queue handles for connected clients.
    queues: HashMap<ClientId, Outbound>,
}

pub struct Router {
    state: RwLock<RouterState>,
    metrics: Arc<BrokerMetrics>,
}

impl Router {
    pub fn new(metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            metrics,
        }
    }

    /// Make a connected client's outbound queue reachable for fan-out.
    pub fn register(&self, client_id: ClientId, outbound: Outbound) {
        self.state.write().queues.insert(client_id, outbound);
    }

    pub fn deregister(&self, client_id: &ClientId) {
        self.state.write().queues.remove(client_id);
    }

    /// Insert or update a subscription. The caller validates the filter and
    /// caps the granted qos.
    pub fn subscribe(&self, client_id: ClientId, filter: Bytes, qos: QoS) {
        debug!(client_id = %client_id, filter = %String::from_utf8_lossy(&filter), ?qos, "subscription added");
        self.state
            .write()
            .subscriptions
            .entry(filter)
            .or_default()
            .insert(client_id, qos);
    }

    pub fn unsubscribe(&self, client_id: &ClientId, filter: &[u8]) {
        let mut state = self.state.write();
        if let Some(clients) = state.subscriptions.get_mut(filter) {
            clients.remove(client_id);
            if clients.is_empty() {
                state.subscriptions.remove(filter);
            }
        }
    }

    /// Drop every subscription held by a client (session teardown).
    pub fn unsubscribe_all(&self, client_id: &ClientId) {
        let mut state = self.state.write();
        state.subscriptions.retain(|_, clients| {
            clients.remove(client_id);
            !clients.is_empty()
        });
        debug!(client_id = %client_id, "all subscriptions removed");
    }

    /// Route one application message: update the retained store when asked,
    /// then fan out to every matching subscriber at
    /// `min(message_qos, subscription_qos)` with the retain flag cleared.
    pub fn route(&self, message: &Message) {
        let deliveries = if message.retain {
            let mut state = self.state.write();
            if message.payload.is_empty() {
                if state.retained.remove(&message.topic).is_some() {
                    debug!(topic = %String::from_utf8_lossy(&message.topic), "retained message deleted");
                }
            } else {
                state.retained.insert(
                    message.topic.clone(),
                    RetainedMessage {
                        payload: message.payload.clone(),
                        qos: message.qos,
                    },
                );
            }
            collect_recipients(&state, message)
        } else {
            collect_recipients(&self.state.read(), message)
        };

        self.metrics.record_publish_routed();
        // Enqueue outside the router lock; enqueues never block.
        for (outbound, qos) in deliveries {
            let packet_id = (qos > QoS::AtMostOnce).then(|| outbound.next_packet_id());
            match encode_publish(&message.topic, &message.payload, qos, false, false, packet_id) {
                Ok(frame) => {
                    if qos == QoS::AtMostOnce {
                        outbound.send_droppable(frame);
                    } else {
                        outbound.send_required(frame);
                    }
                    self.metrics.record_delivery();
                }
                Err(err) => {
                    warn!(topic = %String::from_utf8_lossy(&message.topic), %err, "dropping undeliverable publish");
                }
            }
        }
    }

    /// Deliver retained messages matching freshly accepted filters. Invoked
    /// by the manager after the SUBACK is queued, so acknowledgement always
    /// precedes retained traffic.
    pub fn send_retained(&self, client_id: &ClientId, accepted: &[(Bytes, QoS)]) {
        let deliveries = {
            let state = self.state.read();
            let Some(outbound) = state.queues.get(client_id).cloned() else {
                return;
            };
            let mut out = Vec::new();
            for (filter, granted) in accepted {
                for (topic, retained) in &state.retained {
                    if topic_matches(topic, filter) {
                        out.push((
                            topic.clone(),
                            retained.payload.clone(),
                            retained.qos.min(*granted),
                        ));
                    }
                }
            }
            (out, outbound)
        };
        let (messages, outbound) = deliveries;
        for (topic, payload, qos) in messages {
            let packet_id = (qos > QoS::AtMostOnce).then(|| outbound.next_packet_id());
            match encode_publish(&topic, &payload, qos, true, false, packet_id) {
                Ok(frame) => {
                    if qos == QoS::AtMostOnce {
                        outbound.send_droppable(frame);
                    } else {
                        outbound.send_required(frame);
                    }
                    self.metrics.record_delivery();
                }
                Err(err) => {
                    warn!(topic = %String::from_utf8_lossy(&topic), %err, "dropping undeliverable retained publish");
                }
            }
        }
    }

    pub fn get_retained(&self, topic: &[u8]) -> Option<RetainedMessage> {
        self.state.read().retained.get(topic).cloned()
    }

    /// True if the client holds at least one subscription (test support).
    pub fn has_subscriptions(&self, client_id: &ClientId) -> bool {
        self.state
            .read()
            .subscriptions
            .values()
            .any(|clients| clients.contains_key(client_id))
    }
}

fn collect_recipients(state: &RouterState, message: &Message) -> Vec<(Outbound, QoS)> {
    // A client matched by several filters gets one delivery at the highest
    // granted qos.
    let mut matched: HashMap<&ClientId, QoS> = HashMap::new();
    for (filter, clients) in &state.subscriptions {
        if topic_matches(&message.topic, filter) {
            for (client_id, sub_qos) in clients {
                let granted = message.qos.min(*sub_qos);
                matched
                    .entry(client_id)
                    .and_modify(|qos| *qos = (*qos).max(granted))
                    .or_insert(granted);
            }
        }
    }
    matched
        .into_iter()
        .filter_map(|(client_id, qos)| {
            state
                .queues
                .get(client_id)
                .map(|outbound| (outbound.clone(), qos))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{decode_packet, Packet};
    use tokio::sync::mpsc;

    fn matches(topic: &str, filter: &str) -> bool {
        topic_matches(topic.as_bytes(), filter.as_bytes())
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("a/b/c", "a/#"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(matches("a", "a/#"));
        assert!(matches("a/b/c", "#"));
        assert!(!matches("a/b", "a/+/c"));
        assert!(!matches("b", "a/#"));
    }

    #[test]
    fn dollar_topics_hidden_from_leading_wildcards() {
        assert!(!matches("$SYS/x", "+/x"));
        assert!(!matches("$SYS/x", "#"));
        assert!(matches("$SYS/x", "$SYS/+"));
        assert!(matches("$SYS/x", "$SYS/x"));
    }

    #[test]
    fn empty_levels_are_literal() {
        assert!(matches("a//b", "a//b"));
        assert!(matches("a//b", "a/+/b"));
        assert!(!matches("a/b", "a//b"));
    }

    #[test]
    fn filter_validation() {
        assert!(valid_filter(b"a/b"));
        assert!(valid_filter(b"a/+/b"));
        assert!(valid_filter(b"a/#"));
        assert!(valid_filter(b"#"));
        assert!(valid_filter(b"+"));
        assert!(valid_filter(b"a//b"));
        assert!(!valid_filter(b""));
        assert!(!valid_filter(b"a/#/b"));
        assert!(!valid_filter(b"foo+/bar"));
        assert!(!valid_filter(b"a/b#"));
        assert!(!valid_filter(b"#/a"));
    }

    fn test_router() -> Router {
        Router::new(Arc::new(BrokerMetrics::default()))
    }

    fn attach(router: &Router, client: &str) -> mpsc::Receiver<Bytes> {
        let (outbound, rx) = Outbound::new(16, Arc::new(BrokerMetrics::default()));
        router.register(ClientId::from(client), outbound);
        rx
    }

    fn recv_publish(rx: &mut mpsc::Receiver<Bytes>) -> crate::mqtt::PublishPacket {
        let frame = rx.try_recv().expect("expected a delivery");
        match decode_packet(&frame).expect("frame decodes") {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {}", other.kind()),
        }
    }

    #[test]
    fn fan_out_downgrades_qos() {
        let router = test_router();
        let mut rx = attach(&router, "c1");
        router.subscribe(ClientId::from("c1"), Bytes::from_static(b"sports/+"), QoS::AtLeastOnce);

        router.route(&Message {
            topic: Bytes::from_static(b"sports/tennis"),
            payload: Bytes::from_static(b"hi"),
            qos: QoS::AtMostOnce,
            retain: false,
        });
        let publish = recv_publish(&mut rx);
        assert_eq!(publish.topic.as_ref(), b"sports/tennis");
        assert_eq!(publish.payload.as_ref(), b"hi");
        assert_eq!(publish.qos, QoS::AtMostOnce);
        assert!(!publish.retain);
        assert!(publish.packet_id.is_none());
    }

    #[test]
    fn overlapping_filters_deliver_once_at_max_qos() {
        let router = test_router();
        let mut rx = attach(&router, "c1");
        router.subscribe(ClientId::from("c1"), Bytes::from_static(b"a/#"), QoS::AtMostOnce);
        router.subscribe(ClientId::from("c1"), Bytes::from_static(b"a/b"), QoS::AtLeastOnce);

        router.route(&Message {
            topic: Bytes::from_static(b"a/b"),
            payload: Bytes::from_static(b"x"),
            qos: QoS::AtLeastOnce,
            retain: false,
        });
        let publish = recv_publish(&mut rx);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(publish.packet_id.is_some());
        assert!(rx.try_recv().is_err(), "must deliver exactly once");
    }

    #[test]
    fn retained_set_overwrite_and_delete() {
        let router = test_router();
        let topic = Bytes::from_static(b"news");
        router.route(&Message {
            topic: topic.clone(),
            payload: Bytes::from_static(b"41"),
            qos: QoS::AtMostOnce,
            retain: true,
        });
        router.route(&Message {
            topic: topic.clone(),
            payload: Bytes::from_static(b"42"),
            qos: QoS::AtMostOnce,
            retain: true,
        });
        assert_eq!(
            router.get_retained(b"news").map(|m| m.payload),
            Some(Bytes::from_static(b"42"))
        );

        router.route(&Message {
            topic,
            payload: Bytes::new(),
            qos: QoS::AtMostOnce,
            retain: true,
        });
        assert!(router.get_retained(b"news").is_none());
    }

    #[test]
    fn retained_delivered_on_subscribe_with_retain_flag() {
        let router = test_router();
        router.route(&Message {
            topic: Bytes::from_static(b"news"),
            payload: Bytes::from_static(b"42"),
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        let mut rx = attach(&router, "c2");
        let filter = Bytes::from_static(b"news");
        router.subscribe(ClientId::from("c2"), filter.clone(), QoS::AtMostOnce);
        router.send_retained(&ClientId::from("c2"), &[(filter, QoS::AtMostOnce)]);

        let publish = recv_publish(&mut rx);
        assert_eq!(publish.payload.as_ref(), b"42");
        assert!(publish.retain);
        // min(message qos 1, granted qos 0)
        assert_eq!(publish.qos, QoS::AtMostOnce);
    }

    #[test]
    fn unsubscribe_prunes_empty_filter_entries() {
        let router = test_router();
        let c1 = ClientId::from("c1");
        let c2 = ClientId::from("c2");
        router.subscribe(c1.clone(), Bytes::from_static(b"a/b"), QoS::AtMostOnce);
        router.subscribe(c2.clone(), Bytes::from_static(b"a/b"), QoS::AtMostOnce);

        router.unsubscribe(&c1, b"a/b");
        assert!(!router.has_subscriptions(&c1));
        assert!(router.has_subscriptions(&c2));

        router.unsubscribe(&c2, b"a/b");
        assert!(router.state.read().subscriptions.is_empty());
    }

    #[test]
    fn unsubscribe_all_prunes_table() {
        let router = test_router();
        let c1 = ClientId::from("c1");
        router.subscribe(c1.clone(), Bytes::from_static(b"a/#"), QoS::AtMostOnce);
        router.subscribe(c1.clone(), Bytes::from_static(b"b"), QoS::AtMostOnce);
        assert!(router.has_subscriptions(&c1));

        router.unsubscribe_all(&c1);
        assert!(!router.has_subscriptions(&c1));
    }

    #[test]
    fn live_fan_out_never_sets_retain_flag() {
        let router = test_router();
        let mut rx = attach(&router, "c1");
        router.subscribe(ClientId::from("c1"), Bytes::from_static(b"t"), QoS::AtMostOnce);
        router.route(&Message {
            topic: Bytes::from_static(b"t"),
            payload: Bytes::from_static(b"live"),
            qos: QoS::AtMostOnce,
            retain: true,
        });
        let publish = recv_publish(&mut rx);
        assert!(!publish.retain, "live deliveries clear the retain flag");
        assert!(router.get_retained(b"t").is_some());
    }
}
