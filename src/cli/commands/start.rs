//! Start command - launches the hermod broker.

use crate::broker::SessionManager;
use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::core::time::SystemClock;
use crate::net::TcpServer;
use crate::ops::observability::BrokerMetrics;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let (config, from_file) = if args.config.exists() {
        (Config::load(&args.config)?, true)
    } else {
        (Config::default(), false)
    };

    let filter = EnvFilter::try_new(&config.telemetry.log_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !from_file {
        warn!(
            path = %args.config.display(),
            "config file not found, using built-in defaults"
        );
    }

    let metrics = Arc::new(BrokerMetrics::default());
    let manager = Arc::new(SessionManager::new(
        SystemClock,
        metrics.clone(),
        &config.limits,
    ));

    let server = TcpServer::bind(&config.listeners.tcp_bind, manager.clone()).await?;
    info!(addr = %server.local_addr()?, "MQTT listener bound");

    // Keep-alive watchdog.
    let sweeper = manager.clone();
    let interval = Duration::from_secs(config.limits.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweeper.tick();
        }
    });

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, closing connections");
            manager.shutdown();
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        connections = snapshot.connections_opened,
        publishes = snapshot.publishes_routed,
        deliveries = snapshot.deliveries_enqueued,
        "broker stopped"
    );
    Ok(())
}
