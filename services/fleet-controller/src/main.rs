//! fleetd
//!
//! Fleet controller daemon. Runs the control loop against the configured
//! backend and serves the control surface over HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_controller::{
    api::{self, AppState},
    config::{Config, GatewayKind},
    gateway::{HttpGateway, HttpGatewayConfig, MockGateway, ProvisioningGateway},
    launch::TcpAgentConnector,
    state::StateStore,
    surface::{FleetHandle, COMMAND_BUFFER},
    FleetController,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleetd");
    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        gateway = ?config.gateway,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;
    let store = StateStore::open(config.db_path()).context("opening checkpoint store")?;

    let gateway: Arc<dyn ProvisioningGateway> = match &config.gateway {
        GatewayKind::Mock => {
            warn!("Using mock gateway; no real nodes will be provisioned");
            Arc::new(MockGateway::new())
        }
        GatewayKind::Http { url, token } => Arc::new(HttpGateway::new(HttpGatewayConfig {
            base_url: url.clone(),
            token: token.clone(),
            request_timeout: Duration::from_secs(config.provision_timeout_secs),
        })?),
    };
    let gateway_name = gateway.name().to_string();
    let connector = Arc::new(TcpAgentConnector::new(config.handshake_timeout()));

    let mut controller =
        FleetController::new(gateway, connector, config.controller_config()).with_store(store);
    controller.recover().await.context("recovering from checkpoint")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fleet, commands) = FleetHandle::channel(COMMAND_BUFFER);

    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { controller.run(shutdown_rx, commands).await }
    });

    let app = api::create_router(AppState::new(fleet, gateway_name));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The controller reclaims the fleet within its own grace period
    info!("Waiting for fleet reclaim...");
    let wait = Duration::from_secs(config.shutdown_grace_secs + 10);
    match tokio::time::timeout(wait, controller_handle).await {
        Ok(Ok(report)) => info!(
            reclaimed = report.reclaimed,
            abandoned = report.abandoned.len(),
            "Controller stopped"
        ),
        Ok(Err(e)) => error!(error = %e, "Controller task panicked"),
        Err(_) => warn!("Controller did not shut down in time"),
    }

    info!("fleetd shutdown complete");
    Ok(())
}
