use crate::auditor::Auditor;
use crate::config::parse::{load_config, ConfigError};
use crate::config::types::{SourceKind, CHAN_SIZE};
use crate::input::{Listener, Scanner};
use crate::pipeline::PipelineProvider;
use crate::sender::{ConnectionError, ConnectionManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Wires the agent together and runs it until interrupted: connection
/// manager → auditor → pipeline bank → network listeners → file scanner.
pub async fn run(config_path: Option<PathBuf>) -> Result<(), RunError> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/skiff/config.yml");
            eprintln!("  /etc/skiff/config.yml");
            eprintln!("\nUse --config <path> to specify a config file.");
            std::process::exit(1);
        }
    };

    let (config, sources) = load_config(&config_path)?;
    tokio::fs::create_dir_all(&config.run_path).await?;

    let conn_manager = Arc::new(ConnectionManager::new(
        &config.log_dd_url,
        config.log_dd_port,
        config.skip_ssl_validation,
    )?);

    let (auditor_tx, auditor_rx) = mpsc::channel(CHAN_SIZE);
    let auditor = Auditor::new(&config.run_path)
        .with_cleanup_period(Duration::from_secs(config.registry_cleanup_seconds));
    let auditor_handle = auditor.start(auditor_rx);

    let mut provider = PipelineProvider::new();
    provider.start(conn_manager, auditor_tx.clone(), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut listener = Listener::new(&sources, &mut provider);
    listener.start(shutdown_rx.clone()).await;

    let mut scanner = Scanner::new(&sources, &mut provider, auditor.clone());
    scanner.setup().await;
    let scanner_handle = tokio::spawn(scanner.run(shutdown_rx.clone()));

    // Container streams come from the runtime's log API; without a runtime
    // client wired in, docker sources cannot be started from here.
    for source in &sources {
        if source.kind == SourceKind::Docker {
            warn!(
                image = source.image.as_deref().unwrap_or(""),
                "docker sources need a container runtime stream, skipping"
            );
        }
    }

    info!("agent started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    // Producers first: the scanner stops its tailers, their decoders drain.
    let _ = shutdown_tx.send(true);
    scanner_handle.await?;

    // Then one Stop per pipeline, and finally the auditor's last flush once
    // every sender has hung up.
    provider.stop().await;
    drop(auditor_tx);
    auditor_handle.await?;

    info!("agent stopped");
    Ok(())
}
