#![forbid(unsafe_code)]

//! `crackq` — hashcat job orchestration server binary.
//!
//! Bootstraps configuration, the session database, the coordinator (with
//! recovery of unfinished sessions), the retention service, and the IPC
//! server for `crackq-ctl`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crackq::config::GlobalConfig;
use crackq::ipc::server::spawn_ipc_server;
use crackq::orchestrator::coordinator::Coordinator;
use crackq::persistence::session_repo::SessionRepo;
use crackq::persistence::{db, retention};
use crackq::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "crackq", about = "hashcat job orchestration server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("crackq server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = Arc::new(GlobalConfig::load_from_path(&args.config)?);
    info!(
        engine = %config.engine.binary.display(),
        max_concurrent_jobs = config.scheduler.max_concurrent_jobs,
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    let repo = SessionRepo::new(Arc::clone(&db));
    info!("database connected");

    // ── Start coordinator (recovers unfinished sessions) ─
    let (orchestrator, coordinator_handle) =
        Coordinator::start(Arc::clone(&config), repo.clone()).await?;
    info!("coordinator started");

    // ── Start retention service ──────────────────────────
    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        repo,
        config.sessions_dir(),
        config.retention_days,
        ct.clone(),
    );
    info!("retention service started");

    // ── Start IPC server ────────────────────────────────
    let ipc_handle = spawn_ipc_server(&config.ipc_name, orchestrator.clone(), ct.clone())?;

    info!("crackq ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // ── Graceful shutdown: checkpoint live engines ──────
    orchestrator.shutdown().await;
    drop(orchestrator);

    // ── Wait for background tasks ───────────────────────
    let (coordinator, retention, ipc) =
        tokio::join!(coordinator_handle, retention_handle, ipc_handle);
    for (task, joined) in [
        ("coordinator", coordinator),
        ("retention", retention),
        ("ipc", ipc),
    ] {
        if let Err(err) = joined {
            error!(task, %err, "background task ended abnormally");
        }
    }
    info!("crackq shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
