mod error;
mod handlers;
mod routes;

use anyhow::{Context, Result};
use clap::Parser;
use chrono::Utc;
use daemon::{
    config::ConverterConfig,
    sweep, ExpiryScheduler, FfmpegTranscoder, FileQuotaStore, JobRunner, Pipeline,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use std::fs;
use log::{info, warn};
use routes::AppState;

/// Video to MP3 conversion server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    // Load configuration
    let cfg = ConverterConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("vid2mp3 starting");
    info!("Configuration loaded:");
    info!("  Port: {}", cfg.port);
    info!("  Allowed origins: {:?}", cfg.allowed_origins);
    info!("  Upload dir: {}", cfg.upload_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Quota file: {}", cfg.quota_file.display());
    info!("  Daily limit: {}", cfg.daily_limit);
    info!("  Retention: {}s", cfg.retention_secs);
    info!("  Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    info!("  Job timeout: {}s", cfg.job_timeout_secs);

    for dir in [&cfg.upload_dir, &cfg.output_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    // Cleanup timers from a previous run are gone; sweep what they would have removed
    info!("🔄 Checking for orphaned files...");
    let swept = sweep::sweep_orphans(
        &[cfg.upload_dir.clone(), cfg.output_dir.clone()],
        cfg.retention(),
        SystemTime::now(),
    )
    .await
    .context("Failed to sweep orphaned files on startup")?;
    if swept > 0 {
        info!("✅ Startup sweep removed {} orphaned file(s)", swept);
    } else {
        info!("✅ Startup sweep found no orphaned files");
    }

    let quota = FileQuotaStore::open(&cfg.quota_file, Utc::now())
        .context("Failed to initialise quota store")?;
    let transcoder = Arc::new(FfmpegTranscoder::new(&cfg));
    let runner = JobRunner::from_config(&cfg, transcoder);
    let (expiry, _expiry_task) = ExpiryScheduler::spawn();
    let pipeline = Pipeline::new(&cfg, Arc::new(quota), runner, expiry);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = routes::build_router(AppState {
        config: Arc::new(cfg),
        pipeline: Arc::new(pipeline),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("vid2mp3 stopped; pending cleanups are dropped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
