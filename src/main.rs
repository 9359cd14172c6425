//! Limiter node daemon
//!
//! Seeds a node from the panel, keeps its roster, alive devices and rules in
//! sync, and reports traffic and online devices until it is told to stop.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;

use panda_limiter::business::{BackgroundTasks, FilePanel, HookBackend, NodeController, TaskConfig};
use panda_limiter::config::{CliArgs, LimitConfig};
use panda_limiter::core::{ConnectionHook, LimiterRegistry};
use panda_limiter::logger::{self, log};

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Shutdown signal received...");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(&cli.log_mode);

    log::info!(
        node = %cli.node_tag,
        panel_file = %cli.panel_file.display(),
        "Starting limiter node"
    );

    let registry = Arc::new(LimiterRegistry::new());
    let hook = Arc::new(ConnectionHook::new(Arc::clone(&registry)));
    let backend = Arc::new(HookBackend::new(Arc::clone(&hook)));
    let panel = Arc::new(FilePanel::new(&cli.panel_file, &cli.data_dir)?);

    let controller = Arc::new(NodeController::new(
        &cli.node_tag,
        LimitConfig::from_cli(&cli),
        panel,
        backend,
        hook,
    ));
    controller.start().await?;

    let task_config = TaskConfig::resolve(&cli, controller.node_info().await.as_ref());
    let tasks = BackgroundTasks::new(task_config, Arc::clone(&controller)).start();

    shutdown_signal().await?;

    // Final report runs inside the task shutdown
    tasks.shutdown().await;
    if let Err(e) = controller.close().await {
        log::warn!(error = %e, "Failed to close node");
    }
    log::info!("Limiter node stopped");
    Ok(())
}
