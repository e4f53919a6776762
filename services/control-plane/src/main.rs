//! Shipway Control Plane
//!
//! The central coordination service for the platform: holds the live agent
//! connections, routes inbound agent traffic, enforces the container
//! restart policy, and reconciles fleet health against persisted intent.

use std::sync::Arc;

use anyhow::Result;
use shipway_control_plane::{
    api,
    config,
    events::EventBus,
    health::HealthWorker,
    hub::{ConnectionReaper, Hub},
    restart::RestartPolicyEngine,
    router::MessageRouter,
    state::AppState,
    store::{postgres::PgStore, Store},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SHIPWAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Shipway control plane");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Connect to the store
    let store = match PgStore::connect(&config.database).await {
        Ok(store) => {
            info!("Database connection established");
            store
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = store.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let store: Arc<dyn Store> = Arc::new(store);
    let hub = Hub::new();
    let events = EventBus::new();
    let restart = RestartPolicyEngine::new(hub.clone(), store.clone(), events.clone());
    let router = MessageRouter::new(store.clone(), hub.clone(), events.clone(), restart);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the stale-connection reaper in background
    let reaper = ConnectionReaper::new(hub.clone(), store.clone());
    let reaper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reaper.run(shutdown_rx).await;
        }
    });

    // Start the health reconciliation worker in background
    let health_worker = HealthWorker::new(store.clone(), hub.clone(), events.clone());
    let health_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            health_worker.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(store, hub, events, router);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
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

    // Wait for shutdown signal (Ctrl+C)
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

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reaper_handle).await {
        warn!(error = %e, "Stale-connection reaper did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, health_handle).await {
        warn!(error = %e, "Health worker did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
