//! modeld server binary.
//!
//! Startup order matters: the single-instance lock is checked before the
//! runtime spins up (exit code 2 for a running peer), and any startup error
//! exits with code 1 after printing to stderr.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fs2::FileExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use modeld::catalog::ModelCatalog;
use modeld::cli::Cli;
use modeld::config::ServerConfig;
use modeld::pool::BackendSlotPool;
use modeld::process::ProcessLauncher;
use modeld::router::Router;
use modeld::logging;
use modeld::server::{self, AppState};

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.into_config();

    if let Err(e) = std::fs::create_dir_all(&config.cache_root) {
        eprintln!(
            "Error: cannot create cache directory {}: {e}",
            config.cache_root.display()
        );
        return ExitCode::from(1);
    }

    // One server per machine: an advisory lock on the cache root.
    let lock_file = match std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(config.lock_path())
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: cannot open instance lock: {e}");
            return ExitCode::from(1);
        }
    };
    if lock_file.try_lock_exclusive().is_err() {
        eprintln!("Error: another instance of modeld is already running.");
        return ExitCode::from(2);
    }

    let result = run(config);
    drop(lock_file);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(config: ServerConfig) -> Result<()> {
    let (log_control, _log_guard) =
        logging::init(&config.log_level, config.log_dir.as_deref())?;

    info!("Starting modeld...");
    info!("  Version: {}", env!("CARGO_PKG_VERSION"));
    info!("  Host: {}", config.host);
    info!("  Port: {}", config.port);
    info!("  Log level: {}", config.log_level);

    let catalog = ModelCatalog::load(&config).context("failed to load model catalog")?;
    if let Some(dir) = &config.extra_models_dir {
        info!(dir = %dir.display(), "Scanning extra models directory");
        catalog.scan_extra_dir(dir);
    }

    let pool = BackendSlotPool::new(
        Arc::new(ProcessLauncher::new()),
        config.quotas,
        config.load_timeout,
        config.stop_grace,
    );
    let router = Router::new(
        Arc::clone(&catalog),
        pool,
        config.server_options.clone(),
        config.acquire_deadline,
    );

    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("Listening on http://{addr}");

    let state = AppState {
        router,
        log_control: Some(log_control),
        log_file: config.log_file_path(),
        shutdown,
    };
    server::run(listener, state).await?;

    info!("modeld shut down cleanly");
    Ok(())
}

/// Cancel the serve loop on SIGINT or SIGTERM.
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
            }
        }
        token.cancel();
    });
}
