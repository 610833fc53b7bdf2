use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::mqtt::codec::MAX_REMAINING_LENGTH;

fn default_tcp_bind() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    100
}

/// 256 MiB ceiling, clamped to what a four-byte varint can express.
fn default_max_packet_size() -> usize {
    MAX_REMAINING_LENGTH
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Top-level configuration for the hermod broker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listeners: ListenerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_tcp_bind")]
    pub tcp_bind: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            tcp_bind: default_tcp_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Frames buffered per session between the router and the socket.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Largest accepted remaining-length on an inbound packet.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Keep-alive sweep cadence.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_packet_size: default_max_packet_size(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// tracing-subscriber EnvFilter directive, e.g. "info" or "hermod=debug".
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.outbound_queue_capacity == 0 {
            bail!("limits.outbound_queue_capacity must be at least 1");
        }
        if self.limits.max_packet_size == 0 || self.limits.max_packet_size > MAX_REMAINING_LENGTH {
            bail!(
                "limits.max_packet_size must be in 1..={}",
                MAX_REMAINING_LENGTH
            );
        }
        if self.limits.sweep_interval_secs == 0 {
            bail!("limits.sweep_interval_secs must be at least 1");
        }
        Ok(())
    }
}
