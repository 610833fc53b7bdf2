//! End-to-end broker scenarios over real TCP connections, driving the wire
//! with hand-built packets.

use hermod::broker::SessionManager;
use hermod::core::config::LimitsConfig;
use hermod::core::time::SystemClock;
use hermod::mqtt::encode_length;
use hermod::net::TcpServer;
use hermod::ops::observability::BrokerMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker() -> (SocketAddr, Arc<SessionManager<SystemClock>>) {
    let metrics = Arc::new(BrokerMetrics::default());
    let manager = Arc::new(SessionManager::new(
        SystemClock,
        metrics,
        &LimitsConfig::default(),
    ));
    let server = TcpServer::bind("127.0.0.1:0", manager.clone())
        .await
        .expect("bind test listener");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    (addr, manager)
}

fn frame_with(first: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![first];
    out.extend_from_slice(&encode_length(body.len()).unwrap());
    out.extend_from_slice(body);
    out
}

fn connect_frame(
    client_id: &str,
    keep_alive: u16,
    will: Option<(&str, &str)>,
) -> Vec<u8> {
    let mut body = vec![0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04];
    let mut flags = 0x02u8; // clean session
    if will.is_some() {
        flags |= 0x04;
    }
    body.push(flags);
    body.extend_from_slice(&keep_alive.to_be_bytes());
    body.extend_from_slice(&(client_id.len() as u16).to_be_bytes());
    body.extend_from_slice(client_id.as_bytes());
    if let Some((topic, payload)) = will {
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload.as_bytes());
    }
    frame_with(0x10, &body)
}

fn publish_frame(topic: &str, payload: &[u8], qos: u8, retain: bool, packet_id: Option<u16>) -> Vec<u8> {
    let mut first = 0x30 | (qos << 1);
    if retain {
        first |= 0x01;
    }
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    if let Some(id) = packet_id {
        body.extend_from_slice(&id.to_be_bytes());
    }
    body.extend_from_slice(payload);
    frame_with(first, &body)
}

fn subscribe_frame(packet_id: u16, filters: &[(&str, u8)]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&packet_id.to_be_bytes());
    for (filter, qos) in filters {
        body.extend_from_slice(&(filter.len() as u16).to_be_bytes());
        body.extend_from_slice(filter.as_bytes());
        body.push(*qos);
    }
    frame_with(0x82, &body)
}

const PINGREQ: [u8; 2] = [0xC0, 0x00];
const PINGRESP: [u8; 2] = [0xD0, 0x00];
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    timeout(WAIT, async {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.expect("frame header");
        let mut out = vec![header[0]];
        let mut byte = header[1];
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        loop {
            out.push(byte);
            remaining += usize::from(byte & 0x7F) * multiplier;
            if byte & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
            let mut next = [0u8; 1];
            stream.read_exact(&mut next).await.expect("varint byte");
            byte = next[0];
        }
        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).await.expect("frame body");
        out.extend_from_slice(&body);
        out
    })
    .await
    .expect("timed out reading frame")
}

async fn connect_client(addr: SocketAddr, client_id: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(&connect_frame(client_id, 60, None))
        .await
        .expect("send connect");
    let connack = read_frame(&mut stream).await;
    assert_eq!(connack, vec![0x20, 0x02, 0x00, 0x00]);
    stream
}

/// Round-trip a PINGREQ; proves every earlier packet on this connection has
/// been fully processed and nothing else is queued for delivery first.
async fn ping_fence(stream: &mut TcpStream) {
    stream.write_all(&PINGREQ).await.expect("send pingreq");
    assert_eq!(read_frame(stream).await, PINGRESP.to_vec());
}

async fn expect_closed(stream: &mut TcpStream) {
    let closed = timeout(WAIT, async {
        let mut buf = [0u8; 16];
        matches!(stream.read(&mut buf).await, Ok(0) | Err(_))
    })
    .await
    .expect("timed out waiting for close");
    assert!(closed, "expected the broker to close the connection");
}

#[tokio::test]
async fn s1_connect_ping_disconnect() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    ping_fence(&mut c1).await;
    c1.write_all(&DISCONNECT).await.unwrap();
    expect_closed(&mut c1).await;
}

#[tokio::test]
async fn s2_subscribe_then_publish() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    c1.write_all(&subscribe_frame(10, &[("sports/+", 1)]))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut c1).await, vec![0x90, 0x03, 0x00, 10, 0x01]);

    let mut c2 = connect_client(addr, "c2").await;
    c2.write_all(&publish_frame("sports/tennis", b"hi", 0, false, None))
        .await
        .unwrap();

    assert_eq!(
        read_frame(&mut c1).await,
        publish_frame("sports/tennis", b"hi", 0, false, None)
    );
}

#[tokio::test]
async fn s3_retained_message_lifecycle() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    c1.write_all(&publish_frame("news", b"42", 0, true, None))
        .await
        .unwrap();
    ping_fence(&mut c1).await;

    let mut c2 = connect_client(addr, "c2").await;
    c2.write_all(&subscribe_frame(1, &[("news", 0)])).await.unwrap();
    assert_eq!(read_frame(&mut c2).await, vec![0x90, 0x03, 0x00, 1, 0x00]);
    // Retained delivery carries the retain flag.
    assert_eq!(
        read_frame(&mut c2).await,
        publish_frame("news", b"42", 0, true, None)
    );

    // Empty retained payload deletes the entry.
    c1.write_all(&publish_frame("news", b"", 0, true, None))
        .await
        .unwrap();
    ping_fence(&mut c1).await;

    let mut c3 = connect_client(addr, "c3").await;
    c3.write_all(&subscribe_frame(2, &[("news", 0)])).await.unwrap();
    assert_eq!(read_frame(&mut c3).await, vec![0x90, 0x03, 0x00, 2, 0x00]);
    ping_fence(&mut c3).await;
}

#[tokio::test]
async fn s4_qos1_publish_acknowledged() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    c1.write_all(&publish_frame("t", b"x", 1, false, Some(77)))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut c1).await, vec![0x40, 0x02, 0x00, 77]);
}

#[tokio::test]
async fn s5_keep_alive_timeout_publishes_will() {
    let (addr, manager) = start_broker().await;
    let mut observer = connect_client(addr, "observer").await;
    observer
        .write_all(&subscribe_frame(1, &[("wills/c1", 0)]))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut observer).await, vec![0x90, 0x03, 0x00, 1, 0x00]);

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(&connect_frame("c1", 1, Some(("wills/c1", "gone"))))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut c1).await, vec![0x20, 0x02, 0x00, 0x00]);

    // Past keep_alive * 1.5 with no traffic the sweep must close c1.
    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.tick();

    expect_closed(&mut c1).await;
    assert_eq!(
        read_frame(&mut observer).await,
        publish_frame("wills/c1", b"gone", 0, false, None)
    );
}

#[tokio::test]
async fn s6_multi_level_wildcard() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    c1.write_all(&subscribe_frame(1, &[("a/#", 0)])).await.unwrap();
    assert_eq!(read_frame(&mut c1).await, vec![0x90, 0x03, 0x00, 1, 0x00]);

    let mut c2 = connect_client(addr, "c2").await;
    for topic in ["a", "a/b", "a/b/c", "b"] {
        c2.write_all(&publish_frame(topic, topic.as_bytes(), 0, false, None))
            .await
            .unwrap();
    }
    ping_fence(&mut c2).await;

    for topic in ["a", "a/b", "a/b/c"] {
        assert_eq!(
            read_frame(&mut c1).await,
            publish_frame(topic, topic.as_bytes(), 0, false, None)
        );
    }
    // "b" must not arrive; the fence proves the pipeline is drained.
    ping_fence(&mut c1).await;
}

#[tokio::test]
async fn per_pair_delivery_is_fifo() {
    let (addr, _manager) = start_broker().await;
    let mut subscriber = connect_client(addr, "sub").await;
    subscriber
        .write_all(&subscribe_frame(1, &[("t", 0)]))
        .await
        .unwrap();
    assert_eq!(read_frame(&mut subscriber).await, vec![0x90, 0x03, 0x00, 1, 0x00]);

    let mut publisher = connect_client(addr, "pub").await;
    for i in 0u8..20 {
        publisher
            .write_all(&publish_frame("t", &[i], 0, false, None))
            .await
            .unwrap();
    }

    for i in 0u8..20 {
        assert_eq!(
            read_frame(&mut subscriber).await,
            publish_frame("t", &[i], 0, false, None),
            "message {i} out of order"
        );
    }
}

#[tokio::test]
async fn malformed_packet_closes_connection() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    // Varint with five continuation bytes.
    c1.write_all(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).await.unwrap();
    expect_closed(&mut c1).await;
}

#[tokio::test]
async fn unsupported_packet_type_closes_connection() {
    let (addr, _manager) = start_broker().await;
    let mut c1 = connect_client(addr, "c1").await;
    // UNSUBSCRIBE is outside the supported subset.
    c1.write_all(&[0xA2, 0x02, 0x00, 0x01]).await.unwrap();
    expect_closed(&mut c1).await;
}

#[tokio::test]
async fn takeover_closes_previous_connection() {
    let (addr, _manager) = start_broker().await;
    let mut first = connect_client(addr, "dup").await;
    let mut second = connect_client(addr, "dup").await;
    expect_closed(&mut first).await;
    ping_fence(&mut second).await;
}
