//! profiled - profile server daemon

use clap::Parser;
use profiled::config::Config;
use profiled::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("profiled=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!("profiled v{}", env!("CARGO_PKG_VERSION"));

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        shutdown_server.shutdown();
    });

    if let Err(e) = server.run().await {
        error!("server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
