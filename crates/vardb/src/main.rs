// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! vardb - variable broker
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (9000)
//! vardb
//!
//! # Named community on a custom port
//! vardb --port 9001 --community alpha
//!
//! # Playback at 4x speed with verbose logging
//! vardb --time-warp 4 --log-level debug
//!
//! # Everything from a file
//! vardb --config broker.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vardb::{Broker, BrokerConfig};

/// vardb - publish/subscribe variable broker
#[derive(Parser, Debug)]
#[command(name = "vardb")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "9000")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Community name of this broker
    #[arg(long, default_value = "#1")]
    community: String,

    /// Time acceleration factor
    #[arg(long, default_value = "1.0")]
    time_warp: f64,

    /// Client idle timeout in seconds
    #[arg(long, default_value = "5.0")]
    timeout: f64,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    // Load or create config
    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        BrokerConfig::from_file(&config_path)?
    } else {
        BrokerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            community: args.community,
            time_warp: args.time_warp,
            client_timeout_secs: args.timeout,
            ..Default::default()
        }
    };

    let bind = format!("{}:{}", config.bind_address, config.port);
    info!("+----------------------------------------------------+");
    info!(
        "|       vardb variable broker v{:<21} |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:      {:38} |", bind);
    info!("|  Community: {:38} |", config.community);
    info!("|  Time warp: {:38} |", format!("{}x", config.time_warp));
    info!(
        "|  Timeout:   {:38} |",
        format!("{}s", config.client_timeout_secs)
    );
    info!("+----------------------------------------------------+");

    let broker = Broker::new(config).await?;

    // Handle shutdown signals
    let broker_handle = broker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping broker...");
        broker_handle.shutdown().await;
    });

    broker.run().await?;

    info!("Broker stopped");
    Ok(())
}
