pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;
pub mod schema;
pub mod sensor;
pub mod server;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod time;

use crate::{config::AppConfig, server::Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bootstraps the sensor service from environment configuration and runs it
/// until SIGINT or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());
    Server::new(config).await?.run(token).await
}

fn spawn_signal_handler(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received shutdown signal");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    });
}
