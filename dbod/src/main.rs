//! DevBox Orchestrator - Daemon
//!
//! The daemon owns the per-user session registry, deploys and supervises
//! the worker on each devbox, and runs the health-check/recovery loops.
//! Everything is reachable through the HTTP control API.

#![forbid(unsafe_code)]

mod config;
mod deploy;
mod http_api;
mod monitor;
mod recovery;
mod sessions;
mod supervisor;
mod targets;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use dbo_common::logging::{LogConfig, init_logging};
use dbo_common::transport::ssh::{SshConnector, SshOptions};

use crate::deploy::Deployer;
use crate::monitor::{HealthChecker, Monitor, UreqProbe};
use crate::recovery::RecoveryEngine;
use crate::sessions::SessionRegistry;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::targets::TargetCatalog;

#[derive(Parser)]
#[command(name = "dbod")]
#[command(author, version, about = "DBO daemon - devbox session and worker orchestration")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the HTTP control API (overrides config)
    #[arg(short, long)]
    listen_port: Option<u16>,

    /// Append logs to this file (rotated daily)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config has its own log level, but logging has to exist before the
    // config loads, so the flag wins and the config value is the fallback.
    let config = config::load_config(cli.config.as_deref())?;
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.general.log_level.clone()
    };
    let _log_guard = init_logging(&LogConfig {
        level,
        file: cli.log_file.clone(),
        json: cli.json_logs,
    });

    info!("Starting DBO daemon...");
    info!("{} deployment targets configured", config.targets.len());

    let targets = Arc::new(TargetCatalog::from_config(&config.targets));

    let connector = Arc::new(SshConnector::new(SshOptions::default()));
    let registry = Arc::new(SessionRegistry::new(
        connector,
        config.remote.clone(),
        config.general.command_log_capacity,
    ));
    let deployer = Arc::new(Deployer::new(registry.clone()));
    let supervisor = Arc::new(Supervisor::new(
        registry.clone(),
        config.remote.clone(),
        SupervisorConfig::default(),
    ));
    let recovery = Arc::new(RecoveryEngine::new(
        registry.clone(),
        deployer.clone(),
        supervisor.clone(),
        config.remote.clone(),
    ));
    let checker = Arc::new(HealthChecker::new(
        Arc::new(UreqProbe),
        std::time::Duration::from_secs(config.monitor.http_timeout_secs),
        config.monitor.diagnostic_log_lines,
    ));
    let monitor = Arc::new(Monitor::new(
        registry.clone(),
        checker,
        recovery,
        config.monitor.clone(),
    ));

    let state = http_api::HttpState {
        sessions: registry,
        deployer,
        supervisor,
        monitor: monitor.clone(),
        targets,
        remote: config.remote.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
        pid: std::process::id(),
    };
    let router = http_api::create_router(state);

    let port = cli.listen_port.unwrap_or(config.general.listen_port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding control API on {}", addr))?;
    info!("Control API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server")?;

    info!("Shutting down, stopping monitor loops...");
    monitor.stop_all().await;
    info!("DBO daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
