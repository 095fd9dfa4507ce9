pub mod broadcast;
pub mod config;
pub mod gesture;
pub mod ingest;
pub mod server;

use crate::broadcast::{BroadcasterHandle, ClientRegistry};
use crate::config::Config;
use crate::ingest::IngestHandle;
use crate::server::{AppState, ServerError};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::path::PathBuf;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(
    name = "tiltstep",
    version,
    about = "Turns motion-sensor streams into direction events for WebSocket clients"
)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration if none exists, then exit
    #[arg(long)]
    write_default: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if cli.write_default {
        if !Config::ensure_default(&config_path).await? {
            info!("{} already exists, leaving it untouched", config_path.display());
        }
        return Ok(());
    }

    let config = Config::load(&config_path).await?;
    if config.sources.is_empty() {
        warn!("No sources configured, clients will never receive events");
    }

    let registry = ClientRegistry::new();
    let cancel = CancellationToken::new();

    // Bind first: without a client endpoint there is nothing to serve
    let listener = server::bind(&config.server).await?;

    let broadcaster =
        BroadcasterHandle::spawn(registry.clone(), config.broadcast.clone(), cancel.clone());

    let mut adapters = Vec::with_capacity(config.sources.len());
    for source in config.sources.iter().cloned() {
        let name = source.name().to_string();
        let spawned = IngestHandle::spawn(
            &name,
            move || source.open(),
            config.classifier,
            config.ingest.clone(),
            broadcaster.bus(),
            cancel.clone(),
        )
        .await;

        match spawned {
            Ok(handle) => adapters.push(handle),
            Err(e) => {
                error!("Source {} failed to start: {}", name, e);
                cancel.cancel();
                for adapter in adapters {
                    adapter.join().await;
                }
                broadcaster.join().await;
                return Err(eyre!("Failed to start source {}: {}", name, e));
            }
        }
    }
    info!("{} ingestion adapters running", adapters.len());

    let state = AppState {
        registry: registry.clone(),
        client_buffer: config.broadcast.client_buffer,
    };
    let mut server = tokio::spawn(server::serve(listener, state, cancel.clone()));

    let server_result = match wait_for_shutdown(tokio::signal::ctrl_c(), &mut server).await {
        ShutdownCause::Signal => {
            info!("Shutdown requested");
            None
        }
        ShutdownCause::EndpointStopped(result) => {
            error!("Client endpoint stopped unexpectedly, shutting down");
            Some(result)
        }
    };
    cancel.cancel();

    for adapter in adapters {
        let name = adapter.name().to_string();
        let stats = adapter.join().await;
        info!("Adapter {} stopped: {:?}", name, stats);
    }

    let stats = broadcaster.join().await;
    info!("Broadcaster stopped: {:?}", stats);

    let server_result = match server_result {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Client endpoint failed: {}", e),
        Err(e) => error!("Client endpoint task failed: {}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

enum ShutdownCause {
    Signal,
    EndpointStopped(Result<Result<(), ServerError>, JoinError>),
}

/// Resolves on the shutdown signal or as soon as the client endpoint exits,
/// whichever comes first. A failing signal listener counts as a signal.
async fn wait_for_shutdown<F>(
    signal: F,
    server: &mut JoinHandle<Result<(), ServerError>>,
) -> ShutdownCause
where
    F: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = signal => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            ShutdownCause::Signal
        }
        result = server => ShutdownCause::EndpointStopped(result),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_config_and_flag() {
        let cli = Cli::parse_from(["tiltstep", "--config", "/tmp/t.toml", "--write-default"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert!(cli.write_default);
    }

    #[tokio::test]
    async fn failed_endpoint_ends_the_wait() {
        let mut server = tokio::spawn(async {
            Err(ServerError::Serve(std::io::Error::other("listener gone")))
        });

        let cause = wait_for_shutdown(std::future::pending(), &mut server).await;
        assert!(matches!(
            cause,
            ShutdownCause::EndpointStopped(Ok(Err(ServerError::Serve(_))))
        ));
    }

    #[tokio::test]
    async fn signal_ends_the_wait_while_endpoint_runs() {
        let mut server = tokio::spawn(std::future::pending::<Result<(), ServerError>>());

        let cause = wait_for_shutdown(async { Ok(()) }, &mut server).await;
        assert!(matches!(cause, ShutdownCause::Signal));
        server.abort();
    }

    #[test]
    fn cli_defaults_to_running() {
        let cli = Cli::parse_from(["tiltstep"]);
        assert!(cli.config.is_none());
        assert!(!cli.write_default);
    }
}
