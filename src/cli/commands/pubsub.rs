//! Subscribe and Publish command implementations (kcat-style MQTT client).

use crate::cli::args::{ConnectionArgs, OutputFormat, PublishArgs, QosLevel, SubscribeArgs};
use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::io::Read as StdRead;
use tokio::io::AsyncBufReadExt;
use tokio::time::{sleep, Duration};

/// Run the subscribe command - connect to broker and stream messages to stdout.
pub async fn run_subscribe(args: SubscribeArgs) -> Result<()> {
    let (client, mut eventloop) = create_mqtt_client(&args.connection, "hermod-sub");

    let qos = args.qos.to_rumqttc();
    for topic in &args.topic {
        client
            .subscribe(topic.clone(), qos)
            .await
            .with_context(|| format!("subscribe to topic '{topic}'"))?;
    }
    eprintln!(
        "subscribed to {} topic(s): {}",
        args.topic.len(),
        args.topic.join(", ")
    );

    let mut disconnecting = false;
    let mut backoff = Backoff::new();
    let mut connected = false;

    loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c(), if !disconnecting => {
                eprintln!("received interrupt, shutting down...");
                disconnecting = true;
                let _ = client.disconnect().await;
            }
            res = eventloop.poll() => {
                match res {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code != rumqttc::ConnectReturnCode::Success {
                            return Err(anyhow::anyhow!("connection rejected: {:?}", ack.code));
                        }
                        if connected {
                            eprintln!("reconnected to {}:{}", args.connection.host, args.connection.port);
                        } else {
                            eprintln!("connected to {}:{}", args.connection.host, args.connection.port);
                            connected = true;
                        }
                        backoff.reset();
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        output_message(&args.format, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(anyhow::anyhow!("connection refused: {code:?}"));
                    }
                    Err(err) => {
                        if disconnecting {
                            break;
                        }
                        connected = false;
                        let delay = backoff.next_delay();
                        eprintln!("connection error: {err}; reconnecting in {}ms...", delay.as_millis());
                        sleep(delay).await;
                    }
                }
                if disconnecting {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Run the publish command - publish messages from stdin or command line.
pub async fn run_publish(args: PublishArgs) -> Result<()> {
    let (client, eventloop) = create_mqtt_client(&args.connection, "hermod-pub");
    let qos = args.qos.to_rumqttc();

    if let Some(ref topic) = args.topic {
        let payload = if let Some(ref message) = args.message {
            message.as_bytes().to_vec()
        } else {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("read stdin")?;
            buf
        };
        eprintln!(
            "publishing {} bytes to '{}' (qos={}, retain={})",
            payload.len(),
            topic,
            qos as u8,
            args.retain
        );
        publish_single(client, eventloop, topic, payload, qos, args.retain).await
    } else {
        publish_multi_stdin(client, eventloop, &args.delimiter, qos, args.retain, args.binary).await
    }
}

// -----------------------------------------------------------------------------
// Subscribe implementation
// -----------------------------------------------------------------------------

/// Exponential backoff for reconnection attempts.
struct Backoff {
    current_ms: u64,
    max_ms: u64,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current_ms: 100,
            max_ms: 30_000,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = (self.current_ms * 2).min(self.max_ms);
        Duration::from_millis(delay)
    }

    fn reset(&mut self) {
        self.current_ms = 100;
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    ts: String,
    topic: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
}

fn output_message(format: &OutputFormat, topic: &str, payload: &[u8]) {
    match format {
        OutputFormat::Json => {
            let (payload_str, payload_b64) = match std::str::from_utf8(payload) {
                Ok(s) => (Some(s), None),
                Err(_) => (
                    None,
                    Some(base64::engine::general_purpose::STANDARD.encode(payload)),
                ),
            };
            let msg = MessageOutput {
                ts: Utc::now().to_rfc3339(),
                topic,
                payload: payload_str,
                payload_b64,
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                println!("{json}");
            }
        }
        OutputFormat::Raw => {
            if let Ok(text) = std::str::from_utf8(payload) {
                println!("{text}");
            } else {
                use std::io::Write;
                let _ = std::io::stdout().write_all(payload);
                let _ = std::io::stdout().write_all(b"\n");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Publish implementation
// -----------------------------------------------------------------------------

async fn publish_single(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topic: &str,
    payload: Vec<u8>,
    qos: QoS,
    retain: bool,
) -> Result<()> {
    client
        .publish(topic, qos, retain, payload)
        .await
        .context("queue publish")?;

    let mut disconnecting = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != rumqttc::ConnectReturnCode::Success {
                    return Err(anyhow::anyhow!("connection rejected: {:?}", ack.code));
                }
            }
            Ok(Event::Incoming(Incoming::PubAck(_))) => {
                eprintln!("published (ack received)");
                disconnecting = true;
                let _ = client.disconnect().await;
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Publish(_))) if qos == QoS::AtMostOnce => {
                eprintln!("published (qos0 sent)");
                disconnecting = true;
                let _ = client.disconnect().await;
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                if disconnecting {
                    break;
                }
                return Err(anyhow::anyhow!("publish failed: {err}"));
            }
        }
    }
    Ok(())
}

async fn publish_multi_stdin(
    client: AsyncClient,
    mut eventloop: EventLoop,
    delimiter: &str,
    qos: QoS,
    retain: bool,
    binary: bool,
) -> Result<()> {
    eprintln!(
        "reading stdin lines with delimiter '{delimiter}' (qos={}, retain={retain}, binary={binary})",
        qos as u8
    );

    let mut reader = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut pending_acks: usize = 0;
    let mut published: usize = 0;
    let mut eof = false;
    let mut disconnecting = false;

    loop {
        tokio::select! {
            line = reader.next_line(), if !eof && !disconnecting => match line {
                Ok(Some(line)) => {
                    let Some((topic, payload_str)) = line.split_once(delimiter) else {
                        eprintln!("skipping malformed line (no delimiter)");
                        continue;
                    };
                    if topic.is_empty() {
                        eprintln!("skipping line with empty topic");
                        continue;
                    }
                    let payload = if binary {
                        match base64::engine::general_purpose::STANDARD.decode(payload_str.trim()) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                eprintln!("skipping line with invalid base64: {err}");
                                continue;
                            }
                        }
                    } else {
                        payload_str.as_bytes().to_vec()
                    };
                    if let Err(err) = client.publish(topic.to_string(), qos, retain, payload).await {
                        eprintln!("failed to queue publish: {err}");
                    } else {
                        pending_acks += 1;
                    }
                }
                Ok(None) | Err(_) => {
                    eof = true;
                    eprintln!("EOF reached; waiting for {pending_acks} pending acks...");
                    if pending_acks == 0 {
                        disconnecting = true;
                        let _ = client.disconnect().await;
                    }
                }
            },
            res = eventloop.poll() => match res {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != rumqttc::ConnectReturnCode::Success {
                        return Err(anyhow::anyhow!("connection rejected: {:?}", ack.code));
                    }
                }
                Ok(Event::Incoming(Incoming::PubAck(_))) => {
                    pending_acks = pending_acks.saturating_sub(1);
                    published += 1;
                    if eof && pending_acks == 0 && !disconnecting {
                        disconnecting = true;
                        let _ = client.disconnect().await;
                    }
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Publish(_))) if qos == QoS::AtMostOnce => {
                    pending_acks = pending_acks.saturating_sub(1);
                    published += 1;
                    if eof && pending_acks == 0 && !disconnecting {
                        disconnecting = true;
                        let _ = client.disconnect().await;
                    }
                }
                Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    if disconnecting {
                        break;
                    }
                    return Err(anyhow::anyhow!("connection error: {err}"));
                }
            },
        }
    }

    eprintln!("published {published} message(s)");
    Ok(())
}

// -----------------------------------------------------------------------------
// MQTT client factory
// -----------------------------------------------------------------------------

fn create_mqtt_client(
    connection: &ConnectionArgs,
    default_prefix: &str,
) -> (AsyncClient, EventLoop) {
    let client_id = connection.client_id.clone().unwrap_or_else(|| {
        format!(
            "{}-{}",
            default_prefix,
            uuid::Uuid::new_v4()
                .to_string()
                .split('-')
                .next()
                .unwrap_or("xxxx")
        )
    });

    let mut options = MqttOptions::new(client_id, &connection.host, connection.port);
    options.set_keep_alive(Duration::from_secs(30));
    AsyncClient::new(options, 64)
}

impl QosLevel {
    fn to_rumqttc(&self) -> QoS {
        match self {
            QosLevel::Qos0 => QoS::AtMostOnce,
            QosLevel::Qos1 => QoS::AtLeastOnce,
        }
    }
}
