mod change;
mod config;
mod coordinator;
mod device;
mod error;
mod orchestrator;
mod raster;
mod session;
mod transfer;

use std::sync::Arc;

use crate::config::Config;
use crate::coordinator::CoordinatorClient;
use crate::orchestrator::PushOrchestrator;
use crate::session::SshTransport;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let coordinator = match CoordinatorClient::new(config.coordinator_url.clone()) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Pushing {} to {}@{}:{}{} (coordinator {})",
        config.push.local_image_path.display(),
        config.endpoint.username,
        config.endpoint.address,
        config.endpoint.port,
        config.push.remote_path,
        config.coordinator_url
    );

    let transport = Arc::new(SshTransport::new(config.ssh));
    let orchestrator = PushOrchestrator::new(
        transport,
        coordinator.clone(),
        coordinator,
        config.endpoint,
        config.push,
    );

    orchestrator.run(shutdown_signal()).await;
}

/// Resolves on Ctrl-C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
