//! Scheduler Core (spec.md §4.7): owns the cron timer wheel, the bounded
//! run queue, the set of in-flight task ids, and dispatches tasks to the
//! appropriate worker type.
//!
//! Grounded in the teacher's `scheduler.rs::start_scheduler` loop (tick ->
//! find due tasks -> `tauri::async_runtime::spawn` a runner for each),
//! generalized from a fixed 60s poll to a next-fire-aware sleep driven by
//! a `tokio::sync::Notify`, and from Tauri's async runtime to a `Runtime`
//! scoped `tokio::spawn` with a bounded admission queue and concurrency
//! cap (spec.md §5).

use crate::cache::{StrmCache, SyncCache};
use crate::model::{StatsSnapshot, Task, TaskId, TaskStatus};
use crate::openlist_client::OpenListClient;
use crate::queue::{RunKind, RunQueue};
use crate::strm_worker::{RunKind as StrmRunKind, StrmWorker};
use crate::sync_worker::{RunKind as SyncRunKind, SyncWorker};
use crate::Runtime;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Default concurrent-run cap: number of CPU cores, per spec.md §4.7.
fn default_concurrency_cap() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub struct Scheduler {
    runtime: Arc<Runtime>,
    next_fire: parking_lot::Mutex<HashMap<TaskId, DateTime<Utc>>>,
    queue: parking_lot::Mutex<RunQueue>,
    running: parking_lot::Mutex<HashSet<TaskId>>,
    notify: tokio::sync::Notify,
    concurrency_cap: usize,
}

impl Scheduler {
    pub fn new(runtime: Arc<Runtime>) -> Arc<Self> {
        Self::with_cap(runtime, default_concurrency_cap())
    }

    pub fn with_cap(runtime: Arc<Runtime>, concurrency_cap: usize) -> Arc<Self> {
        let scheduler = Arc::new(Scheduler {
            runtime,
            next_fire: parking_lot::Mutex::new(HashMap::new()),
            queue: parking_lot::Mutex::new(RunQueue::new()),
            running: parking_lot::Mutex::new(HashSet::new()),
            notify: tokio::sync::Notify::new(),
            concurrency_cap: concurrency_cap.max(1),
        });
        scheduler.recompute_all_next_fire();
        scheduler
    }

    /// (Re)computes `next_fire` for every enabled task from the task store,
    /// called at startup and whenever a task is created, edited, or
    /// enabled/disabled from the external control surface.
    pub fn recompute_all_next_fire(&self) {
        let now = Utc::now();
        let mut map = self.next_fire.lock();
        map.clear();
        for task in self.runtime.task_store.list() {
            if !task.enabled() {
                continue;
            }
            if let Ok(next) = crate::cron_eval::next_fire(task.cron(), now, &self.runtime.tz_name) {
                map.insert(task.id().to_string(), next);
            }
        }
        self.notify.notify_one();
    }

    /// Wakes the loop without changing any schedule — used after a manual
    /// trigger or a task enable/disable so the loop re-evaluates sooner
    /// than its current sleep deadline.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Enqueues a manual run (kind SYNC/STRM matching the task's own
    /// kind). Never changes `next_fire` (spec.md §4.7).
    pub fn trigger_manual(&self, task_id: &str) -> bool {
        let Some(task) = self.runtime.task_store.get(task_id) else {
            return false;
        };
        let kind = match task {
            Task::Sync(_) => RunKind::Sync,
            Task::Strm(_) => RunKind::Strm,
        };
        self.admit(task_id, kind)
    }

    pub fn trigger_full_overwrite(&self, task_id: &str) -> bool {
        self.admit(task_id, RunKind::FullOverwrite)
    }

    pub fn trigger_reconstruct(&self, task_id: &str) -> bool {
        self.admit(task_id, RunKind::Reconstruct)
    }

    fn admit(&self, task_id: &str, kind: RunKind) -> bool {
        let running = self.running.lock();
        if running.contains(task_id) {
            return false;
        }
        drop(running);
        let admitted = self.queue.lock().push(task_id, kind, Utc::now(), false);
        if admitted {
            self.runtime.runtime_state.set_status(task_id, TaskStatus::Queued);
            self.wake();
        }
        admitted
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.running.lock().iter().cloned().collect()
    }

    /// Requests global cancellation; every in-flight worker observes this
    /// at its next safe point (spec.md §5).
    pub fn cancel_all(&self) {
        self.runtime.cancellation.cancel();
    }

    /// The main scheduler loop (spec.md §4.7 steps 1-4). Runs until the
    /// runtime's cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.runtime.cancellation.is_cancelled() {
                return;
            }

            let sleep_for = self.next_sleep_duration();
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => {}
                _ = self.runtime.cancellation.cancelled() => return,
            }

            self.admit_due_tasks();
            self.dispatch_ready();
        }
    }

    fn next_sleep_duration(&self) -> Duration {
        let now = Utc::now();
        let earliest = self.next_fire.lock().values().min().copied();
        match earliest {
            Some(t) if t > now => (t - now).to_std().unwrap_or(Duration::from_secs(1)),
            Some(_) => Duration::from_millis(0),
            None => Duration::from_secs(60),
        }
    }

    fn admit_due_tasks(&self) {
        let now = Utc::now();
        let due: Vec<TaskId> = {
            let map = self.next_fire.lock();
            map.iter().filter(|(_, t)| **t <= now).map(|(id, _)| id.clone()).collect()
        };

        for id in due {
            let Some(task) = self.runtime.task_store.get(&id) else {
                self.next_fire.lock().remove(&id);
                continue;
            };
            if !task.enabled() {
                self.next_fire.lock().remove(&id);
                continue;
            }
            let running = self.running.lock().contains(&id);
            let queued = self.queue.lock().contains(&id);
            if !running && !queued {
                let kind = match task {
                    Task::Sync(_) => RunKind::Sync,
                    Task::Strm(_) => RunKind::Strm,
                };
                if self.queue.lock().push(&id, kind, now, true) {
                    self.runtime.runtime_state.set_status(&id, TaskStatus::Queued);
                }
            }
            // Always advance next_fire so a saturated cap doesn't cause a
            // missed fire to repeat every loop iteration.
            if let Ok(next) = crate::cron_eval::next_fire(task.cron(), now, &self.runtime.tz_name) {
                self.next_fire.lock().insert(id, next);
            } else {
                self.next_fire.lock().remove(&id);
            }
        }
    }

    fn dispatch_ready(self: &Arc<Self>) {
        loop {
            {
                let running = self.running.lock();
                if running.len() >= self.concurrency_cap {
                    return;
                }
            }
            let entry = {
                let mut queue = self.queue.lock();
                queue.pop()
            };
            let Some(entry) = entry else { return };

            let Some(task) = self.runtime.task_store.get(&entry.task_id) else {
                continue;
            };

            self.running.lock().insert(entry.task_id.clone());
            self.runtime.runtime_state.set_status(&entry.task_id, TaskStatus::Running);

            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.run_one(task, entry.kind, entry.scheduled).await;
            });
        }
    }

    async fn run_one(self: Arc<Self>, task: Task, kind: RunKind, scheduled: bool) {
        let runtime = Arc::clone(&self.runtime);
        let task_id = task.id().to_string();

        let outcome = match &task {
            Task::Sync(sync_task) => run_sync(&runtime, sync_task, kind).await,
            Task::Strm(strm_task) => run_strm(&runtime, strm_task, kind).await,
        };

        match outcome {
            TaskOutcome::Ok { stats, warning } => {
                runtime
                    .runtime_state
                    .finish_run(&task_id, stats, TaskStatus::Idle, warning);
                if scheduled {
                    let now = Utc::now();
                    let next = crate::cron_eval::next_fire(task.cron(), now, &runtime.tz_name).ok();
                    let _ = runtime.task_store.touch_schedule(&task_id, Some(now), next);
                    if let Some(next) = next {
                        self.next_fire.lock().insert(task_id.clone(), next);
                    }
                }
            }
            TaskOutcome::Cancelled => {
                runtime
                    .runtime_state
                    .finish_run(&task_id, StatsSnapshot::default(), TaskStatus::Idle, None);
                runtime.log.push(&task_id, "WARN", "run cancelled");
            }
            TaskOutcome::Fatal(e) => {
                runtime
                    .runtime_state
                    .finish_run(&task_id, StatsSnapshot::default(), TaskStatus::Error, Some(e.to_string()));
                runtime.log.push(&task_id, "ERROR", format!("run failed: {e}"));
            }
        }

        self.running.lock().remove(&task_id);
        self.wake();
    }
}

enum TaskOutcome {
    Ok {
        stats: StatsSnapshot,
        warning: Option<String>,
    },
    Cancelled,
    Fatal(crate::error::CloudGatherError),
}

async fn run_sync(runtime: &Runtime, task: &crate::model::SyncTask, kind: RunKind) -> TaskOutcome {
    let cache = SyncCache::load(&runtime.cache_dir, &task.id).unwrap_or_default();
    let settings = runtime.settings.get();

    let worker = SyncWorker {
        task,
        cancellation: runtime.cancellation.clone(),
        runtime_state: runtime.runtime_state.clone(),
        log: runtime.log.clone(),
        retry_count: settings.sync_retry_count,
        stability_delay: Duration::from_secs(runtime.stability_delay_secs),
    };

    let sync_kind = match kind {
        RunKind::FullOverwrite => SyncRunKind::FullOverwrite,
        RunKind::Reconstruct => SyncRunKind::Reconstruct,
        _ => SyncRunKind::Normal,
    };

    let outcome = worker.run(sync_kind, cache).await;

    if let Some(fatal) = outcome.fatal {
        return TaskOutcome::Fatal(fatal);
    }
    if runtime.cancellation.is_cancelled() {
        let _ = outcome.cache.save(&runtime.cache_dir, &task.id);
        return TaskOutcome::Cancelled;
    }

    let _ = outcome.cache.save(&runtime.cache_dir, &task.id);
    TaskOutcome::Ok {
        stats: outcome.stats,
        warning: None,
    }
}

async fn run_strm(runtime: &Runtime, task: &crate::model::StrmTask, kind: RunKind) -> TaskOutcome {
    let cache = StrmCache::load(&runtime.cache_dir, &task.id).unwrap_or_default();
    let settings = runtime.settings.get();

    let client = match OpenListClient::new(&settings.openlist, false) {
        Ok(c) => Arc::new(c),
        Err(e) => return TaskOutcome::Fatal(e),
    };

    let worker = StrmWorker {
        task,
        client,
        extensions: settings.extensions,
        public_base: settings.openlist.public_url.clone(),
        cancellation: runtime.cancellation.clone(),
        runtime_state: runtime.runtime_state.clone(),
        log: runtime.log.clone(),
    };

    let strm_kind = match kind {
        RunKind::FullOverwrite => StrmRunKind::FullOverwrite,
        RunKind::Reconstruct => StrmRunKind::Reconstruct,
        _ => StrmRunKind::Normal,
    };

    let outcome = worker.run(strm_kind, cache).await;

    if let Some(fatal) = outcome.fatal {
        return TaskOutcome::Fatal(fatal);
    }
    if runtime.cancellation.is_cancelled() {
        let _ = outcome.cache.save(&runtime.cache_dir, &task.id);
        return TaskOutcome::Cancelled;
    }

    let _ = outcome.cache.save(&runtime.cache_dir, &task.id);
    TaskOutcome::Ok {
        stats: outcome.stats,
        warning: outcome.protection_warning,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeletePolicy, RuleFlags, SizeFilter, SuffixFilter, SyncTask};
    use crate::Runtime;

    fn sample_sync(id: &str, cron: &str) -> Task {
        Task::Sync(SyncTask {
            id: id.to_string(),
            name: "T1".into(),
            source_path: "/tmp/does-not-matter-src".into(),
            target_path: "/tmp/does-not-matter-dst".into(),
            cron: cron.into(),
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

    #[tokio::test]
    async fn manual_trigger_admits_to_queue_without_touching_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(Runtime::init_for_test(dir.path()).unwrap());
        runtime.task_store.upsert(sample_sync("t1", "*/5 * * * *")).unwrap();

        let scheduler = Scheduler::new(runtime.clone());
        assert!(scheduler.trigger_manual("t1"));
        assert_eq!(scheduler.queue_len(), 1);
        assert!(!scheduler.trigger_manual("t1"));
        assert_eq!(runtime.runtime_state.snapshot("t1").status, TaskStatus::Queued);
    }

    #[test]
    fn recompute_next_fire_skips_disabled_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(Runtime::init_for_test(dir.path()).unwrap());
        let mut task = sample_sync("t1", "*/5 * * * *");
        task.set_enabled(false);
        runtime.task_store.upsert(task).unwrap();

        let scheduler = Scheduler::new(runtime);
        assert!(scheduler.next_fire.lock().is_empty());
    }
}
