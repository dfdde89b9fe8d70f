//! Binary entrypoint (spec.md §6, SPEC_FULL.md §6): wires environment
//! variables, loads `tasks.json`/`settings.json` into a [`Runtime`], starts
//! the scheduler loop, and binds the status stub. Process-level setup
//! that spec.md §1 places out of scope (time zone application, PUID/PGID
//! user switching, container entrypoint behavior) is read and logged here
//! but not acted on beyond that — those are external collaborators, not
//! core algorithms.

use cloudgather::scheduler::Scheduler;
use cloudgather::{default_config_dir, log_ring::LogRingLayer, EnvConfig, Runtime};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};

fn init_logging(env: &EnvConfig, runtime_log: Arc<cloudgather::log_ring::LogRingRegistry>, logs_dir: &std::path::Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(logs_dir, "cloudgather.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let console_filter = EnvFilter::try_new(&env.console_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = tracing_subscriber::fmt::layer().with_filter(console_filter);

    let file_filter = EnvFilter::try_new(&env.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(file_layer.with_filter(file_filter))
        .with(console_layer)
        .with(LogRingLayer::new(runtime_log))
        .init();

    // LOG_SAVE_DAYS retention: tracing-appender's daily roller doesn't
    // prune old files itself, so sweep at startup (cheap, run once).
    prune_old_logs(logs_dir, env.log_save_days);

    Ok(guard)
}

fn prune_old_logs(logs_dir: &std::path::Path, keep_days: u32) {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(keep_days as i64);
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(modified) = meta.modified() else { continue };
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        if modified < cutoff {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = EnvConfig::from_env();
    let config_dir = std::env::var("CLOUDGATHER_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_dir());

    let runtime = Arc::new(Runtime::init(&config_dir, &env)?);
    let _log_guard = init_logging(&env, runtime.log.clone(), &config_dir.join("logs"))?;

    if let (Ok(puid), Ok(pgid)) = (std::env::var("PUID"), std::env::var("PGID")) {
        tracing::info!(puid, pgid, "PUID/PGID configured; user switching is handled by the container entrypoint");
    }
    if env.is_docker {
        tracing::info!("running under IS_DOCKER=1");
    }
    tracing::info!(config_dir = %config_dir.display(), tz = %env.tz_name, "cloudgather starting");

    let scheduler = Scheduler::new(runtime.clone());

    let scheduler_loop = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let addr: SocketAddr = std::env::var("CLOUDGATHER_STATUS_ADDR")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 7890)));

    let server_runtime = runtime.clone();
    let server_scheduler = scheduler.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = cloudgather::server::serve(server_runtime, server_scheduler, addr).await {
            tracing::warn!(error = %e, "status server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
        _ = runtime.cancellation.cancelled() => {}
    }

    scheduler.cancel_all();
    let _ = scheduler_loop.await;
    let _ = server_task.await;

    Ok(())
}
