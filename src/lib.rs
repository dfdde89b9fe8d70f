//! CloudGather core: a long-running service that mirrors files between
//! local filesystems and cloud-mounted / OpenList-indexed storage on a
//! recurring schedule (spec.md §1).
//!
//! Exposes the core as a library with an explicit [`Runtime`] context
//! bundling every shared handle (task store, settings, log ring, live
//! progress registry, cancellation) passed to the scheduler and, through
//! it, to every worker invocation — spec.md §9's "model as an explicit
//! `Runtime` context passed to every worker at spawn time; no hidden
//! ambient state."

pub mod atomic_write;
pub mod cache;
pub mod cron_eval;
pub mod deletion_planner;
pub mod error;
pub mod log_ring;
pub mod model;
pub mod openlist_client;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod strm_worker;
pub mod sync_worker;
pub mod task_store;

use error::Result;
use log_ring::LogRingRegistry;
use model::TaskRuntimeRegistry;
use settings::SettingsStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use task_store::TaskStore;
use tokio_util::sync::CancellationToken;

/// Environment-driven configuration (spec.md §6): `TZ`, `LOG_LEVEL`,
/// `CONSOLE_LEVEL`, `LOG_SAVE_DAYS`, `IS_DOCKER`, `STABILITY_DELAY`.
/// `PUID`/`PGID` are process-setup only and are read directly by `main`,
/// not carried into the `Runtime`.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub tz_name: String,
    pub log_level: String,
    pub console_level: String,
    pub log_save_days: u32,
    pub is_docker: bool,
    pub stability_delay_secs: u64,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        EnvConfig {
            tz_name: std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            console_level: std::env::var("CONSOLE_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_save_days: std::env::var("LOG_SAVE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(7),
            is_docker: std::env::var("IS_DOCKER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            stability_delay_secs: std::env::var("STABILITY_DELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        }
    }
}

/// The default config directory, `~/.cloudgather`, using `dirs-next` (the
/// crate the teacher already depends on for its `.mydevify` data dir).
pub fn default_config_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudgather")
}

/// The explicit runtime context shared by the scheduler and every worker
/// invocation it dispatches. Constructed once at process start.
pub struct Runtime {
    pub task_store: Arc<TaskStore>,
    pub settings: Arc<SettingsStore>,
    pub log: Arc<LogRingRegistry>,
    pub runtime_state: Arc<TaskRuntimeRegistry>,
    pub cancellation: CancellationToken,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub tz_name: String,
    pub stability_delay_secs: u64,
}

impl Runtime {
    /// Loads `tasks.json` / `settings.json` from `config_dir`, creating
    /// `cache/` and `logs/` alongside it (spec.md §6 layout).
    pub fn init(config_dir: &Path, env: &EnvConfig) -> Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let cache_dir = config_dir.join("cache");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(config_dir.join("logs"))?;

        let task_store = Arc::new(TaskStore::load(config_dir)?);
        let settings = Arc::new(SettingsStore::load(config_dir)?);

        Ok(Runtime {
            task_store,
            settings,
            log: Arc::new(LogRingRegistry::new()),
            runtime_state: Arc::new(TaskRuntimeRegistry::default()),
            cancellation: CancellationToken::new(),
            config_dir: config_dir.to_path_buf(),
            cache_dir,
            tz_name: env.tz_name.clone(),
            stability_delay_secs: env.stability_delay_secs,
        })
    }

    /// Test-only convenience constructor with UTC / a 0s stability delay,
    /// used by scheduler/server unit tests that need a full `Runtime`
    /// without reading process environment variables.
    #[doc(hidden)]
    pub fn init_for_test(config_dir: &Path) -> Result<Self> {
        let env = EnvConfig {
            tz_name: "UTC".to_string(),
            log_level: "info".to_string(),
            console_level: "info".to_string(),
            log_save_days: 7,
            is_docker: false,
            stability_delay_secs: 0,
        };
        Self::init(config_dir, &env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_cache_and_logs_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("cfg");
        let runtime = Runtime::init_for_test(&config_dir).unwrap();
        assert!(runtime.cache_dir.exists());
        assert!(config_dir.join("logs").exists());
    }
}
