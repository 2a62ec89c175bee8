//! # group-sync
//!
//! Entry point for the group membership controller.
//!
//! ## Startup Sequence
//!
//! 1. **Tracing** - `RUST_LOG` filter, `info` by default
//! 2. **Configuration** - CLI flags and environment, validated before anything runs
//! 3. **Group source** - the manifest is loaded and the initial listing marked synced
//! 4. **Control Loop** - watches the target group until shutdown
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop the loop after its current pass. The resulting project
//! state is logged as JSON on the way out.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod manifest;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use group_sync_reconciler::{
    ControlLoop, ControllerConfig, GroupFeed, InMemoryGateway, Reconciler, SnapshotObserver,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;
use crate::manifest::{ManifestSource, spawn_poller};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.controller_config();
    config
        .validate()
        .context("Invalid controller configuration")?;

    info!(
        group = %config.target_group,
        resync_secs = config.resync_period.as_secs(),
        queue_capacity = config.event_queue_capacity,
        "group-sync starting"
    );

    let gateway = Arc::new(InMemoryGateway::new());
    let reconciler = Arc::new(Reconciler::new(gateway.clone()));
    let (observer, feed) = SnapshotObserver::from_config(&config);
    let poller = init_group_source(&cli, &config, feed)
        .await
        .context("Group source initialization failed")?;

    let control = ControlLoop::new(config, observer, reconciler)
        .context("Failed to build control loop")?;
    let stopper = control.stopper();
    let mut loop_handle = tokio::spawn(control.run());

    let joined = tokio::select! {
        joined = &mut loop_handle => joined,
        () = wait_for_shutdown() => {
            stopper.stop();
            loop_handle.await
        }
    };
    if let Some(poller) = poller {
        poller.abort();
    }

    let summary = joined
        .context("Control loop task failed")?
        .context("Control loop exited with an error")?;
    info!(
        events = summary.events_handled,
        passes = summary.passes,
        members_failed = summary.members_failed,
        "Control loop finished"
    );

    let snapshot = gateway
        .snapshot_json()
        .await
        .context("Failed to serialize project state")?;
    info!(projects = %snapshot, "Final project state");

    info!("group-sync stopped gracefully");
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start feeding observed groups.
///
/// Without a manifest the initial listing is empty and the loop idles.
async fn init_group_source(
    cli: &Cli,
    config: &ControllerConfig,
    feed: GroupFeed,
) -> Result<Option<JoinHandle<()>>> {
    match &cli.manifest {
        Some(path) => {
            let source = ManifestSource::new(path.clone());
            spawn_poller(source, feed, config.resync_period).await.map(Some)
        }
        None => {
            info!("No manifest given, starting with an empty group listing");
            feed.mark_synced()?;
            Ok(None)
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        () = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
