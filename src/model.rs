//! Persisted task records and the in-memory live state that rides alongside
//! them. Structural fields are serialized to `tasks.json`; live fields
//! (status, stats, progress) are tracked separately in `TaskRuntimeState`
//! per spec.md §4.1 ("live-only fields ... held in memory only").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type TaskId = String;

/// Either task kind, tagged so `tasks.json` entries carry a `type` field
/// (spec.md §6), mirroring the teacher's `#[serde(tag = "type")]` actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Sync(SyncTask),
    Strm(StrmTask),
}

impl Task {
    pub fn id(&self) -> &str {
        match self {
            Task::Sync(t) => &t.id,
            Task::Strm(t) => &t.id,
        }
    }

    pub fn set_id(&mut self, id: TaskId) {
        match self {
            Task::Sync(t) => t.id = id,
            Task::Strm(t) => t.id = id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Task::Sync(t) => &t.name,
            Task::Strm(t) => &t.name,
        }
    }

    pub fn cron(&self) -> &str {
        match self {
            Task::Sync(t) => &t.cron,
            Task::Strm(t) => &t.cron,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Task::Sync(t) => t.enabled,
            Task::Strm(t) => t.enabled,
        }
    }

    pub fn set_enabled(&mut self, value: bool) {
        match self {
            Task::Sync(t) => t.enabled = value,
            Task::Strm(t) => t.enabled = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixMode {
    None,
    Include,
    Exclude,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuffixFilter {
    pub mode: SuffixMode,
    /// Lowercase extensions without a leading dot. `""` denotes
    /// extensionless files.
    pub extensions: Vec<String>,
}

impl Default for SuffixMode {
    fn default() -> Self {
        SuffixMode::None
    }
}

impl SuffixFilter {
    /// `true` if the file should be kept (i.e. not filtered out).
    pub fn admits(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        match self.mode {
            SuffixMode::None => true,
            SuffixMode::Include => self.extensions.iter().any(|e| e == &ext),
            SuffixMode::Exclude => !self.extensions.iter().any(|e| e == &ext),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SizeFilter {
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl SizeFilter {
    pub fn admits(&self, size: u64) -> bool {
        if let Some(min) = self.min_bytes {
            if size < min {
                return false;
            }
        }
        if let Some(max) = self.max_bytes {
            if size > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteTimeBase {
    SyncComplete,
    FileCreate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePolicy {
    pub enabled: bool,
    pub delay_days: u32,
    pub time_base: DeleteTimeBase,
    pub parent_deletion: bool,
    pub parent_levels: u32,
    pub force_delete_nonempty: bool,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        DeletePolicy {
            enabled: false,
            delay_days: 0,
            time_base: DeleteTimeBase::SyncComplete,
            parent_deletion: false,
            parent_levels: 0,
            force_delete_nonempty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Idle,
    Queued,
    Running,
    Error,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
    pub filtered: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    pub success: u64,
    pub skipped: u64,
    pub failed: u64,
    pub percent: f32,
}

impl Progress {
    pub fn recompute_percent(&mut self) {
        self.percent = if self.total == 0 {
            0.0
        } else {
            (self.done as f32 / self.total as f32) * 100.0
        };
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFlags {
    pub rule_not_exists: bool,
    pub rule_size_diff: bool,
    pub rule_mtime_newer: bool,
}

impl RuleFlags {
    pub fn any_enabled(&self) -> bool {
        self.rule_not_exists || self.rule_size_diff || self.rule_mtime_newer
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: TaskId,
    pub name: String,
    pub source_path: String,
    pub target_path: String,
    pub cron: String,
    #[serde(default = "default_thread_cap")]
    pub thread_cap: u32,
    #[serde(default)]
    pub is_slow_storage: bool,
    #[serde(default)]
    pub rules: RuleFlags,
    #[serde(default)]
    pub size_filter: SizeFilter,
    #[serde(default)]
    pub suffix_filter: SuffixFilter,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    pub enabled: bool,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_thread_cap() -> u32 {
    1
}

impl SyncTask {
    /// Effective thread cap: clamped to 2 when the target is slow storage,
    /// per spec.md §3/§4.3.
    pub fn effective_thread_cap(&self) -> u32 {
        if self.is_slow_storage {
            self.thread_cap.min(2).max(1)
        } else {
            self.thread_cap.max(1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrmMode {
    AlistUrl,
    RawUrl,
    AlistPath,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExtraFileFlags {
    pub subtitle: bool,
    pub image: bool,
    pub nfo: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmartProtection {
    pub threshold: usize,
    pub grace_scans: u32,
}

impl Default for SmartProtection {
    fn default() -> Self {
        SmartProtection {
            threshold: 100,
            grace_scans: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrmTask {
    pub id: TaskId,
    pub name: String,
    pub source_dir: String,
    pub target_dir: String,
    pub cron: String,
    pub mode: StrmMode,
    #[serde(default)]
    pub extra_files: ExtraFileFlags,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default)]
    pub wait_time_secs: u32,
    #[serde(default)]
    pub sync_server_delete: bool,
    #[serde(default)]
    pub sync_local_delete: bool,
    #[serde(default)]
    pub suffix_filter: SuffixFilter,
    #[serde(default)]
    pub smart_protection: SmartProtection,
    pub enabled: bool,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_max_workers() -> u32 {
    4
}

impl StrmTask {
    /// Soft upper bound of 10 concurrent workers, per spec.md §4.4.
    pub fn effective_max_workers(&self) -> u32 {
        self.max_workers.clamp(1, 10)
    }
}

/// Live, in-memory-only state for a single task, keyed alongside the
/// persisted record. Never serialized into `tasks.json`.
#[derive(Debug, Clone, Default)]
pub struct TaskRuntimeState {
    pub status: TaskStatus,
    pub last_stats: StatsSnapshot,
    pub progress: Progress,
    pub protection_warning: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskRuntimeRegistry {
    inner: parking_lot::RwLock<HashMap<TaskId, TaskRuntimeState>>,
}

impl TaskRuntimeRegistry {
    pub fn snapshot(&self, id: &str) -> TaskRuntimeState {
        self.inner.read().get(id).cloned().unwrap_or_default()
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) {
        self.inner.write().entry(id.to_string()).or_default().status = status;
    }

    pub fn update_progress(&self, id: &str, f: impl FnOnce(&mut Progress)) {
        let mut guard = self.inner.write();
        let state = guard.entry(id.to_string()).or_default();
        f(&mut state.progress);
        state.progress.recompute_percent();
    }

    pub fn finish_run(&self, id: &str, stats: StatsSnapshot, status: TaskStatus, warning: Option<String>) {
        let mut guard = self.inner.write();
        let state = guard.entry(id.to_string()).or_default();
        state.last_stats = stats;
        state.status = status;
        state.protection_warning = warning;
    }

    pub fn remove(&self, id: &str) {
        self.inner.write().remove(id);
    }
}
