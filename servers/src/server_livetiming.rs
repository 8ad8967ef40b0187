//! # Live Timing Relay
//!
//! Holds one upstream live timing session, merges everything it receives into
//! a consolidated state, and re-broadcasts that state to any number of
//! websocket subscribers on a fixed cadence.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use lib_common::core::{BroadcastScheduler, Dispatcher, state_store};
use lib_common::ingestors::LiveTimingIngestor;

mod livetiming_logic;
use livetiming_logic::{config, downstream, logger};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    let log_path = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    settings.file.log();
    log::info!(
        "Live timing relay starting: upstream {} (hub '{}'), mode {}, logging to {}",
        settings.upstream_url,
        settings.hub,
        settings.mode,
        log_path.display()
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let (writer, reader) = state_store();
    let dispatcher = Arc::new(Dispatcher::new());

    let ingestor = LiveTimingIngestor::new(settings.live_timing_config(), writer)?;
    let scheduler = BroadcastScheduler::new(settings.scheduler_config(), reader.clone(), dispatcher.clone());
    let listener = TcpListener::bind(settings.listen_addr()).await?;
    let app_state = Arc::new(downstream::AppState {
        dispatcher,
        reader,
        shutdown: shutdown_tx.clone(),
    });

    let upstream_handle = tokio::spawn(ingestor.run(shutdown_tx.subscribe()));
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));
    let downstream_handle = tokio::spawn(downstream::run(listener, app_state, shutdown_tx.subscribe()));

    shutdown_signal().await;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let (upstream, scheduler, downstream) = tokio::join!(upstream_handle, scheduler_handle, downstream_handle);
    if let Err(e) = upstream {
        log::error!("Upstream task failed: {}", e);
    }
    if let Err(e) = scheduler {
        log::error!("Scheduler task failed: {}", e);
    }
    match downstream {
        Ok(Err(e)) => log::error!("Downstream server error: {}", e),
        Err(e) => log::error!("Downstream task failed: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => log::info!("Ctrl-C received, initiating shutdown."),
            Err(e) => {
                log::error!("Failed to install Ctrl-C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-unix platforms, just wait forever.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
