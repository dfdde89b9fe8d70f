//! Typed error kinds shared across the task store, workers and scheduler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CloudGatherError>;

/// The error kinds enumerated in the design: one variant per propagation
/// path, not one per failing call site.
#[derive(Debug, Error)]
pub enum CloudGatherError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("source path missing: {0}")]
    SourceMissing(String),

    #[error("target path not writable: {0}")]
    TargetUnwritable(String),

    #[error("copy failed for {path}: {source}")]
    CopyFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("openlist authentication failed: {0}")]
    Auth(String),

    #[error("openlist request failed: {0}")]
    Remote(String),

    #[error("mass-delete protection tripped: {missing} missing leaves exceeds threshold {threshold}")]
    ProtectionTripped { missing: usize, threshold: usize },

    #[error("run cancelled")]
    Cancelled,
}

impl CloudGatherError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        CloudGatherError::CopyFailed {
            path: path.into(),
            source,
        }
    }
}

impl From<std::io::Error> for CloudGatherError {
    fn from(e: std::io::Error) -> Self {
        CloudGatherError::CopyFailed {
            path: String::new(),
            source: e,
        }
    }
}

impl From<serde_json::Error> for CloudGatherError {
    fn from(e: serde_json::Error) -> Self {
        CloudGatherError::InvalidTask(e.to_string())
    }
}

impl From<reqwest::Error> for CloudGatherError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16()) == Some(401) {
            CloudGatherError::Auth(e.to_string())
        } else {
            CloudGatherError::Remote(e.to_string())
        }
    }
}
