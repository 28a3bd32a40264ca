//! # Tempstore Server
//!
//! HTTP API and command line front end for [`tempstore_storage`].

pub mod cli;
pub mod config;
pub mod http;
pub mod logging;

use std::sync::Arc;
use std::time::Duration;

use tempstore_storage::{ArtifactService, Storage, StorageError, Sweeper};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::TempstoreConfig;
use crate::http::AppState;

/// Open storage and build the service and sweeper for `config`
pub async fn open(config: &TempstoreConfig) -> Result<(ArtifactService, Sweeper), StorageError> {
    let storage = Storage::open(config.storage_config()).await?;
    let service = ArtifactService::new(storage.clone(), config.service_config());
    let sweeper = Sweeper::new(storage, config.sweeper_config());
    Ok((service, sweeper))
}

/// Run the sweeper every `every` until `shutdown` fires
pub fn spawn_periodic_sweep(
    sweeper: Sweeper,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweeper.sweep().await {
                        warn!(error = %e, "Periodic sweep failed");
                    }
                }
            }
        }
    })
}

/// Serve the HTTP API until ctrl-c
pub async fn run_server(config: TempstoreConfig) -> anyhow::Result<()> {
    let (service, sweeper) = open(&config).await?;
    let shutdown = CancellationToken::new();

    let sweep_task = config.sweep_interval_secs.map(|secs| {
        info!(interval_secs = secs, "Periodic sweeping enabled");
        spawn_periodic_sweep(sweeper.clone(), Duration::from_secs(secs), shutdown.clone())
    });

    let state = Arc::new(AppState {
        service,
        sweeper,
        admin_token: config.admin_token.clone(),
    });
    let app = http::router(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Tempstore listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = sweep_task {
        task.await?;
    }

    info!("Tempstore stopped");
    Ok(())
}
