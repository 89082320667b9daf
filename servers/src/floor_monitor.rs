use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use lib_fleet::ingestors::WsTransport;
use lib_fleet::retrieve::{ApiClient, FleetClient, ServerTargets};
use lib_fleet::telemetry::Fleet;

mod monitor_logic;
use monitor_logic::supervisor::{Backoff, Supervisor};
use monitor_logic::{board, config, logger};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    if config.token.is_none() {
        log::warn!("No FLEET_TOKEN configured; guarded API calls will be refused.");
    }

    let targets = ServerTargets::new(
        config.apis_url.as_deref().unwrap_or_default(),
        config.edge_url.as_deref().unwrap_or_default(),
        config.baro_url.as_deref().unwrap_or_default(),
    )?;
    let api = Arc::new(FleetClient::new(ApiClient::new(targets, config.session_context())));

    let shutdown = CancellationToken::new();
    let (publisher, board_rx) = watch::channel(Fleet::default());

    let board_handle = tokio::spawn(board::run(
        board_rx,
        config.page_size(),
        config.page_interval(),
        shutdown.clone(),
    ));

    let (base_delay, max_delay) = config.reconnect_delays();
    let supervisor = Supervisor {
        api,
        context: config.session_context(),
        settings: config.session_settings(),
        publisher,
        backoff: Backoff::new(base_delay, max_delay),
    };
    let socket_url = config.socket_url.clone().unwrap_or_default();
    let supervisor_handle = tokio::spawn(supervisor.run(
        move || {
            let url = socket_url.clone();
            async move { WsTransport::connect(&url).await }
        },
        shutdown.clone(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    shutdown.cancel();

    // Wait for components to shut down
    let _ = tokio::try_join!(supervisor_handle, board_handle);

    log::info!("Shutdown complete.");
    Ok(())
}
