#![forbid(unsafe_code)]

//! `filewright` — task pipeline server binary.
//!
//! Bootstraps configuration, the `SQLite` store (with one-time legacy
//! migration), the lock manager and breaker registry, the scheduler loop,
//! the retention service, and the HTTP submission surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use filewright::api::{self, AppState};
use filewright::breaker::BreakerRegistry;
use filewright::config::GlobalConfig;
use filewright::lock::LockManager;
use filewright::notify::WebhookNotifier;
use filewright::planner::HttpPlanner;
use filewright::probe::HttpProbe;
use filewright::store::{db, migration, retention, SessionStore};
use filewright::transport::LocalFsTransport;
use filewright::worker::{Runner, WorkerLoop};
use filewright::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "filewright", about = "Task pipeline server for approved remote file edits", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("filewright server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    let config = Arc::new(config);
    info!("configuration loaded");

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| AppError::Io(format!("cannot create data dir: {err}")))?;

    // ── Initialize store ────────────────────────────────
    let pool = db::connect(&config.db_path()).await?;
    let store = SessionStore::new(pool);
    info!("database connected");

    let locks = Arc::new(LockManager::new(
        config.locks_dir(),
        Duration::from_secs(config.worker.lock_stale_seconds),
    ));

    // One-time import of first-generation JSON session files.
    let migrated = migration::migrate_legacy_sessions(
        &store,
        &locks,
        &config.legacy_sessions_dir(),
        config.lock_timeout(),
    )
    .await?;
    if migrated > 0 {
        info!(migrated, "legacy sessions imported");
    }

    // ── Build injected process-wide state ───────────────
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));

    let planner_url = config.generation.planner_url.clone().ok_or_else(|| {
        AppError::Config("generation.planner_url must be set".into())
    })?;
    let planner = Arc::new(HttpPlanner::new(planner_url));
    let transport = Arc::new(LocalFsTransport::new(
        config.transport.remote_root.clone(),
        config.backups_dir(),
    ));

    let runner = Arc::new(Runner::new(
        Arc::clone(&config),
        store.clone(),
        Arc::clone(&locks),
        Arc::clone(&breakers),
        planner,
        transport,
        Arc::new(HttpProbe::new()),
        Arc::new(WebhookNotifier::new()),
    ));

    // ── Recover tasks interrupted by a prior crash ──────
    match runner.recover_interrupted().await {
        Ok(0) => info!("no interrupted tasks found on startup"),
        Ok(count) => info!(count, "interrupted tasks awaiting resume decision"),
        Err(err) => error!(%err, "startup recovery scan failed"),
    }

    // ── Start background services ───────────────────────
    let ct = CancellationToken::new();
    let retention_handle =
        retention::spawn_retention_task(store, config.retention_days, ct.clone());
    info!("retention service started");

    let worker_handle = Arc::new(WorkerLoop::new(Arc::clone(&runner))).spawn(ct.clone());
    info!("worker loop started");

    let api_state = Arc::new(AppState {
        runner: Arc::clone(&runner),
    });
    let api_ct = ct.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, api_ct).await {
            error!(%err, "submission surface failed");
        }
    });

    info!("filewright server ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(worker_handle, retention_handle, api_handle);
    info!("filewright shut down");

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
