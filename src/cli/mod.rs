//! hermod CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `hermod start` - Start the broker
//! - `hermod subscribe` - Stream MQTT messages (kcat -C style)
//! - `hermod publish` - Send MQTT messages (kcat -P style)

mod args;
pub mod commands;

pub use args::{
    Cli, Commands, ConnectionArgs, OutputFormat, PublishArgs, QosLevel, StartArgs, SubscribeArgs,
};
