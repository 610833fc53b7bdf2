//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// hermod - lightweight MQTT 3.1.1 message broker.
#[derive(Parser)]
#[command(name = "hermod")]
#[command(version)]
#[command(about = "hermod MQTT broker and client tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the hermod broker
    Start(StartArgs),

    /// Subscribe to MQTT topics and stream messages to stdout (kcat-style)
    Subscribe(SubscribeArgs),

    /// Publish MQTT messages from stdin or command line (kcat-style)
    Publish(PublishArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/hermod.toml")]
    pub config: PathBuf,
}

// -----------------------------------------------------------------------------
// Subscribe/Publish commands (kcat-style MQTT client)
// -----------------------------------------------------------------------------

/// Common broker connection arguments shared by subscribe/publish commands.
#[derive(Args, Clone)]
pub struct ConnectionArgs {
    /// Broker hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker TCP port
    #[arg(long, default_value_t = 1883)]
    pub port: u16,

    /// MQTT client identifier (auto-generated if not specified)
    #[arg(long)]
    pub client_id: Option<String>,
}

/// Output format for subscribe command.
#[derive(clap::ValueEnum, Clone, Default)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Raw payload only (no metadata)
    Raw,
}

/// QoS level for MQTT operations.
#[derive(clap::ValueEnum, Clone, Default)]
pub enum QosLevel {
    /// At most once (fire and forget)
    Qos0,
    /// At least once (acknowledged delivery)
    #[default]
    Qos1,
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Comma-separated list of topics to subscribe to
    #[arg(long, value_delimiter = ',', required = true)]
    pub topic: Vec<String>,

    /// QoS level for subscriptions
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Topic to publish to (required for single-message mode)
    #[arg(long)]
    pub topic: Option<String>,

    /// Message payload (if omitted, reads from stdin)
    #[arg(long, requires = "topic")]
    pub message: Option<String>,

    /// Delimiter for stdin multi-topic mode (topic<delim>payload)
    #[arg(long, default_value = ":")]
    pub delimiter: String,

    /// QoS level for publishes
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Set retain flag on published messages
    #[arg(long)]
    pub retain: bool,

    /// Decode payload as base64 (for binary data in stdin multi-topic mode)
    #[arg(long)]
    pub binary: bool,
}
