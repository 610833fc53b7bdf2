//! hermod - unified CLI entrypoint.
//!
//! Usage:
//!   hermod start --config config/hermod.toml
//!   hermod subscribe --topic 'sensors/#'
//!   hermod publish --topic sensors/temp --message 21.5

use anyhow::Result;
use clap::Parser;
use hermod::cli::commands::{run_publish, run_start, run_subscribe};
use hermod::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Subscribe(args) => run_subscribe(args).await,
        Commands::Publish(args) => run_publish(args).await,
    }
}
