// =============================================================================
// Palaver Matrix Homeserver - Main Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Server entry point: parses arguments, loads configuration, initializes
//   logging, builds the database and services, publishes this server's
//   signing key and serves the Matrix endpoints until shutdown.
//
// Dependencies:
//   • Tokio async runtime
//   • CLI parsing with clap
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

use std::path::PathBuf;

use clap::Parser;
use palaver::{api, init_services, services, Config, KeyValueDatabase, Services};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "palaver", version, about = "Federated Matrix homeserver core")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "palaver.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(config).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> palaver::Result<()> {
    let db: &'static KeyValueDatabase = Box::leak(Box::new(KeyValueDatabase::load_or_create(&config)?));
    let built = Services::build(db, config)?;
    init_services(Box::leak(Box::new(built)));

    // Local events verify through the same key path as remote ones.
    services().keys.publish_own_key()?;

    let address = services().globals.config.address;
    info!(
        server_name = services().globals.server_name().as_str(),
        %address,
        "listening"
    );

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, api::router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    services().globals.shutdown();
}
