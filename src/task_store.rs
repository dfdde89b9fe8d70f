//! Persistent `task-id -> task record` mapping (spec.md §4.1). Grounded in
//! the teacher's `scheduler.rs` `TaskStore`/`load_store`/`save_store`, but
//! generalized from a process-wide `static Lazy` to an explicit handle
//! owned by the `Runtime`, per the "no hidden ambient state" design note.

use crate::atomic_write::write_atomic;
use crate::error::{CloudGatherError, Result};
use crate::model::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskDocument {
    tasks: Vec<Task>,
}

/// Serialized view of a task for validation purposes; only structural
/// fields participate (live fields never reach this struct in the first
/// place, since `Task` itself carries none).
pub struct TaskStore {
    path: PathBuf,
    inner: parking_lot::RwLock<Vec<Task>>,
}

impl TaskStore {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("tasks.json");
        let tasks = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let doc: TaskDocument = serde_json::from_str(&raw)?;
            doc.tasks
        } else {
            Vec::new()
        };
        Ok(TaskStore {
            path,
            inner: parking_lot::RwLock::new(tasks),
        })
    }

    fn persist(&self, tasks: &[Task]) -> Result<()> {
        let doc = TaskDocument {
            tasks: tasks.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Task> {
        self.inner.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().iter().find(|t| t.id() == id).cloned()
    }

    /// Fully replaces the record (creating it if absent). Never a partial
    /// write (spec.md §4.1 contract). An empty id (a new task submitted by
    /// the external control surface) is assigned a fresh id here, mirroring
    /// the teacher's `task.id = uuid::Uuid::new_v4().to_string()` on create.
    pub fn upsert(&self, mut task: Task) -> Result<()> {
        if task.id().trim().is_empty() {
            task.set_id(uuid::Uuid::new_v4().to_string());
        }
        validate(&task)?;
        let mut guard = self.inner.write();
        if let Some(existing) = guard.iter_mut().find(|t| t.id() == task.id()) {
            *existing = task;
        } else {
            guard.push(task);
        }
        self.persist(&guard)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.write();
        let before = guard.len();
        guard.retain(|t| t.id() != id);
        if guard.len() == before {
            return Err(CloudGatherError::InvalidTask(format!("task not found: {id}")));
        }
        self.persist(&guard)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut guard = self.inner.write();
        let task = guard
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| CloudGatherError::InvalidTask(format!("task not found: {id}")))?;
        task.set_enabled(enabled);
        self.persist(&guard)
    }

    /// Used by the scheduler to update `next_run`/`last_run` without going
    /// through the full `upsert` validation path (those fields are always
    /// internally consistent by construction).
    pub fn touch_schedule(
        &self,
        id: &str,
        last_run: Option<chrono::DateTime<chrono::Utc>>,
        next_run: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let mut guard = self.inner.write();
        let task = guard
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or_else(|| CloudGatherError::InvalidTask(format!("task not found: {id}")))?;
        match task {
            Task::Sync(t) => {
                t.last_run = last_run;
                t.next_run = next_run;
            }
            Task::Strm(t) => {
                t.last_run = last_run;
                t.next_run = next_run;
            }
        }
        self.persist(&guard)
    }
}

fn validate(task: &Task) -> Result<()> {
    if task.id().trim().is_empty() {
        return Err(CloudGatherError::InvalidTask("task id must not be empty".into()));
    }
    crate::cron_eval::CronSchedule::parse(task.cron())
        .map_err(|_| CloudGatherError::InvalidTask(format!("invalid cron expression: {}", task.cron())))?;
    match task {
        Task::Sync(t) => {
            if t.thread_cap == 0 {
                return Err(CloudGatherError::InvalidTask("thread_cap must be >= 1".into()));
            }
            if let (Some(min), Some(max)) = (t.size_filter.min_bytes, t.size_filter.max_bytes) {
                if min > max {
                    return Err(CloudGatherError::InvalidTask("size_filter min > max".into()));
                }
            }
            if t.source_path.trim().is_empty() || t.target_path.trim().is_empty() {
                return Err(CloudGatherError::InvalidTask("source/target path must not be empty".into()));
            }
        }
        Task::Strm(t) => {
            if t.source_dir.trim().is_empty() || t.target_dir.trim().is_empty() {
                return Err(CloudGatherError::InvalidTask("source/target dir must not be empty".into()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleFlags, SizeFilter, SuffixFilter, DeletePolicy, SyncTask};

    fn sample_sync(id: &str) -> Task {
        Task::Sync(SyncTask {
            id: id.to_string(),
            name: "T1".into(),
            source_path: "/src".into(),
            target_path: "/dst".into(),
            cron: "*/5 * * * *".into(),
            thread_cap: 1,
            is_slow_storage: false,
            rules: RuleFlags {
                rule_not_exists: true,
                ..Default::default()
            },
            size_filter: SizeFilter::default(),
            suffix_filter: SuffixFilter::default(),
            delete_policy: DeletePolicy::default(),
            enabled: true,
            last_run: None,
            next_run: None,
        })
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        store.upsert(sample_sync("t1")).unwrap();
        let fetched = store.get("t1").unwrap();
        assert_eq!(fetched.id(), "t1");
    }

    #[test]
    fn upsert_assigns_an_id_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        store.upsert(sample_sync("")).unwrap();
        let tasks = store.list();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].id().is_empty());
    }

    #[test]
    fn upsert_rejects_invalid_cron() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        let mut task = sample_sync("t1");
        if let Task::Sync(t) = &mut task {
            t.cron = "not a cron".into();
        }
        assert!(store.upsert(task).is_err());
    }

    #[test]
    fn delete_missing_task_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        assert!(store.delete("nope").is_err());
    }

    #[test]
    fn persisted_document_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TaskStore::load(dir.path()).unwrap();
            store.upsert(sample_sync("t1")).unwrap();
        }
        let reloaded = TaskStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.list().len(), 1);
    }

    #[test]
    fn set_enabled_toggles_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::load(dir.path()).unwrap();
        store.upsert(sample_sync("t1")).unwrap();
        store.set_enabled("t1", false).unwrap();
        assert!(!store.get("t1").unwrap().enabled());
    }
}
