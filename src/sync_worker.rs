//! Directory Sync Worker (spec.md §4.3): stateless per-invocation engine
//! that crawls a source tree, classifies each file, copies under
//! cloud-friendly pacing, and applies the deletion planner at the end of a
//! normal run.
//!
//! Grounded in the teacher's `task_runner.rs` attempt/retry loop shape
//! (per-item status, retry-with-backoff, progress emission), generalized
//! from shell-command steps to file copies running on a bounded
//! `tokio::sync::Semaphore` pool instead of the teacher's per-step
//! sequential execution.

use crate::cache::{SyncCache, SyncCacheEntry, SyncEntryStatus};
use crate::deletion_planner;
use crate::error::{CloudGatherError, Result};
use crate::model::{DeletePolicy, RuleFlags, SizeFilter, StatsSnapshot, SuffixFilter, SyncTask, TaskRuntimeRegistry};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// How a run was invoked; `FULL_OVERWRITE` and `RECONSTRUCT` change the
/// worker's behavior per spec.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Normal,
    FullOverwrite,
    Reconstruct,
}

pub struct SyncWorkerOutcome {
    pub stats: StatsSnapshot,
    pub cache: SyncCache,
    pub fatal: Option<CloudGatherError>,
}

struct DiscoveredFile {
    rel_path: PathBuf,
    source_path: PathBuf,
    size: u64,
    mtime: chrono::DateTime<Utc>,
    created: Option<chrono::DateTime<Utc>>,
}

/// Cleans up `.cgpart` leftovers from a crashed previous run before
/// discovery begins (spec.md §4.3: "Partial writes on crash are discovered
/// by the .cgpart suffix and cleaned at next run start").
fn clean_stale_part_files(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(crate::atomic_write::PART_SUFFIX) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn passes_filters(rel_path: &Path, size: u64, suffix: &SuffixFilter, size_filter: &SizeFilter) -> bool {
    let ext = extension_of(rel_path);
    suffix.admits(&ext) && size_filter.admits(size)
}

/// Union-of-rules decision (spec.md §4.3 step 3 and DESIGN.md Open
/// Question 1): if no rule is enabled, behave as `rule_not_exists` only.
/// A missing target trivially satisfies any enabled size/mtime rule too.
fn should_copy(rules: &RuleFlags, target: &Path, source_size: u64, source_mtime: chrono::DateTime<Utc>) -> bool {
    let target_meta = std::fs::metadata(target).ok();
    let target_exists = target_meta.is_some();

    let effective_not_exists = rules.rule_not_exists || !rules.any_enabled();

    if effective_not_exists && !target_exists {
        return true;
    }
    if !target_exists {
        // Any other enabled rule against a nonexistent target is
        // trivially satisfied.
        return rules.rule_size_diff || rules.rule_mtime_newer;
    }

    let meta = target_meta.unwrap();
    if rules.rule_size_diff && meta.len() != source_size {
        return true;
    }
    if rules.rule_mtime_newer {
        if let Ok(target_mtime) = meta.modified() {
            let target_mtime: chrono::DateTime<Utc> = target_mtime.into();
            if source_mtime > target_mtime + chrono::Duration::seconds(1) {
                return true;
            }
        }
    }
    false
}

async fn copy_one(
    source: &Path,
    target: &Path,
    mtime: chrono::DateTime<Utc>,
    retry_count: u32,
    initial_backoff: Duration,
    timeout: Duration,
) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CloudGatherError::io(parent.display().to_string(), e))?;
    }

    let part_path = crate::atomic_write::part_path_for(target);
    let mut backoff = initial_backoff;
    let mut last_err = None;

    for attempt in 0..=retry_count {
        let result = tokio::time::timeout(timeout, copy_attempt(source, &part_path, target, mtime)).await;
        match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => {
                last_err = Some(CloudGatherError::io(
                    source.display().to_string(),
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "copy timed out"),
                ));
            }
        }
        let _ = tokio::fs::remove_file(&part_path).await;
        if attempt < retry_count {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    Err(last_err.unwrap())
}

async fn copy_attempt(source: &Path, part_path: &Path, target: &Path, mtime: chrono::DateTime<Utc>) -> Result<()> {
    tokio::fs::copy(source, part_path)
        .await
        .map_err(|e| CloudGatherError::io(source.display().to_string(), e))?;

    // Preserve source mtime on the temp file before the atomic rename.
    if let Ok(file) = std::fs::File::open(part_path) {
        let mtime_std: std::time::SystemTime = mtime.into();
        let _ = file.set_modified(mtime_std);
    }

    tokio::fs::rename(part_path, target).await.map_err(|e| {
        // Rename failure: drop the temp file and mark failed, per spec.
        let target_display = target.display().to_string();
        CloudGatherError::io(target_display, e)
    })
}

fn discover(source_root: &Path, suffix: &SuffixFilter, size_filter: &SizeFilter) -> Result<(Vec<DiscoveredFile>, u64)> {
    if !source_root.exists() {
        return Err(CloudGatherError::SourceMissing(source_root.display().to_string()));
    }

    let mut files = Vec::new();
    let mut filtered = 0u64;

    for entry in WalkDir::new(source_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(crate::atomic_write::PART_SUFFIX) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let rel = match entry.path().strip_prefix(source_root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => continue,
        };

        if !passes_filters(&rel, meta.len(), suffix, size_filter) {
            filtered += 1;
            continue;
        }

        let mtime: chrono::DateTime<Utc> = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH).into();
        let created: Option<chrono::DateTime<Utc>> = meta.created().ok().map(Into::into);

        files.push(DiscoveredFile {
            rel_path: rel,
            source_path: entry.path().to_path_buf(),
            size: meta.len(),
            mtime,
            created,
        });
    }

    Ok((files, filtered))
}

/// Waits until a file's mtime has been stable for `stability_delay`
/// seconds before treating it as copy-ready (SPEC_FULL.md §4.3
/// supplement, `STABILITY_DELAY` env var).
async fn is_stable(path: &Path, stability_delay: Duration) -> bool {
    let before = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(m) => m,
        Err(_) => return true,
    };
    tokio::time::sleep(stability_delay).await;
    let after = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(m) => m,
        Err(_) => return true,
    };
    before == after
}

pub struct SyncWorker<'a> {
    pub task: &'a SyncTask,
    pub cancellation: CancellationToken,
    pub runtime_state: Arc<TaskRuntimeRegistry>,
    pub log: Arc<crate::log_ring::LogRingRegistry>,
    pub retry_count: u32,
    pub stability_delay: Duration,
}

impl<'a> SyncWorker<'a> {
    pub async fn run(&self, kind: RunKind, mut cache: SyncCache) -> SyncWorkerOutcome {
        let source_root = PathBuf::from(&self.task.source_path);
        let target_root = PathBuf::from(&self.task.target_path);

        if kind != RunKind::Reconstruct {
            if let Err(e) = std::fs::create_dir_all(&target_root) {
                return SyncWorkerOutcome {
                    stats: StatsSnapshot::default(),
                    cache,
                    fatal: Some(CloudGatherError::TargetUnwritable(format!(
                        "{}: {e}",
                        target_root.display()
                    ))),
                };
            }
        }

        if kind == RunKind::Normal {
            clean_stale_part_files(&target_root);
        }

        let (files, filtered) = match discover(&source_root, &self.task.suffix_filter, &self.task.size_filter) {
            Ok(v) => v,
            Err(e) => {
                return SyncWorkerOutcome {
                    stats: StatsSnapshot::default(),
                    cache,
                    fatal: Some(e),
                };
            }
        };

        let total = files.len() as u64;
        self.runtime_state.update_progress(&self.task.id, |p| {
            p.total = total;
            p.done = 0;
        });

        let success = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.task.effective_thread_cap() as usize));
        let initial_backoff = if self.task.is_slow_storage {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(1)
        };
        let copy_timeout = if self.task.is_slow_storage {
            Duration::from_secs(600)
        } else {
            Duration::from_secs(120)
        };

        let mut join_set = tokio::task::JoinSet::new();
        let cache_updates: Arc<parking_lot::Mutex<Vec<(String, SyncCacheEntry)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        for file in files {
            if self.cancellation.is_cancelled() {
                break;
            }
            let target_path = target_root.join(&file.rel_path);
            let rel_key = file.rel_path.to_string_lossy().to_string();

            let copy_needed = match kind {
                RunKind::FullOverwrite => true,
                RunKind::Reconstruct => false,
                RunKind::Normal => should_copy(&self.task.rules, &target_path, file.size, file.mtime),
            };

            if kind == RunKind::Reconstruct {
                // No copy: insert SYNCED when target already matches.
                if let Ok(meta) = std::fs::metadata(&target_path) {
                    if meta.len() == file.size {
                        cache.entries.insert(
                            rel_key,
                            SyncCacheEntry {
                                size: file.size,
                                mtime: file.mtime,
                                last_sync: Some(Utc::now()),
                                file_create: file.created,
                                status: SyncEntryStatus::Synced,
                            },
                        );
                    }
                }
                done.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if !copy_needed {
                skipped.fetch_add(1, Ordering::Relaxed);
                done.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let permit = semaphore.clone();
            let success = success.clone();
            let failed = failed.clone();
            let done = done.clone();
            let runtime_state = self.runtime_state.clone();
            let task_id = self.task.id.clone();
            let cache_updates = cache_updates.clone();
            let stability_delay = self.stability_delay;
            let source_path = file.source_path.clone();
            let mtime = file.mtime;
            let size = file.size;
            let created = file.created;
            let retry_count = self.retry_count;
            let cancellation = self.cancellation.clone();
            let log = self.log.clone();

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                if cancellation.is_cancelled() {
                    return;
                }
                if kind == RunKind::Normal && !is_stable(&source_path, stability_delay).await {
                    // Not stable yet this pass; treat as a transient skip,
                    // it will be picked up on the next scheduled run.
                    skipped.fetch_add(1, Ordering::Relaxed);
                    done.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                let result = copy_one(&source_path, &target_path, mtime, retry_count, initial_backoff, copy_timeout).await;
                let status = match &result {
                    Ok(()) => {
                        success.fetch_add(1, Ordering::Relaxed);
                        SyncEntryStatus::Synced
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        log.push(&task_id, "WARN", format!("copy failed for {}: {e}", source_path.display()));
                        SyncEntryStatus::Failed
                    }
                };

                cache_updates.lock().push((
                    rel_key,
                    SyncCacheEntry {
                        size,
                        mtime,
                        last_sync: if matches!(status, SyncEntryStatus::Synced) {
                            Some(Utc::now())
                        } else {
                            None
                        },
                        file_create: created,
                        status,
                    },
                ));

                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                runtime_state.update_progress(&task_id, |p| {
                    p.done = n;
                    p.success = success.load(Ordering::Relaxed);
                    p.skipped = skipped.load(Ordering::Relaxed);
                    p.failed = failed.load(Ordering::Relaxed);
                });
            });
        }

        while join_set.join_next().await.is_some() {}

        for (key, entry) in cache_updates.lock().drain(..) {
            cache.entries.insert(key, entry);
        }

        let stats = StatsSnapshot {
            total,
            success: success.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            filtered,
        };

        if kind == RunKind::Normal && !self.cancellation.is_cancelled() {
            run_deletion_pass(self.task, &mut cache);
        }

        SyncWorkerOutcome {
            stats,
            cache,
            fatal: None,
        }
    }
}

/// End-of-run source deletion pass (spec.md §4.3): consult the deletion
/// planner for every `SYNCED` entry, then ascend parent directories up to
/// `delete_parent_levels`, vetoed by any file not yet due for deletion.
fn run_deletion_pass(task: &SyncTask, cache: &mut SyncCache) {
    let policy: &DeletePolicy = &task.delete_policy;
    if !policy.enabled {
        return;
    }
    let now = Utc::now();
    let source_root = PathBuf::from(&task.source_path);

    let mut to_delete: Vec<String> = Vec::new();
    for (rel_path, entry) in cache.entries.iter() {
        if entry.status != SyncEntryStatus::Synced {
            continue;
        }
        let decision = deletion_planner::plan(policy, entry, now, true);
        if decision.delete {
            to_delete.push(rel_path.clone());
        }
    }

    let mut touched_dirs: HashSet<PathBuf> = HashSet::new();
    for rel in &to_delete {
        let abs = source_root.join(rel);
        if std::fs::remove_file(&abs).is_ok() {
            if let Some(entry) = cache.entries.get_mut(rel) {
                entry.status = SyncEntryStatus::Deleted;
            }
            if let Some(parent) = abs.parent() {
                touched_dirs.insert(parent.to_path_buf());
            }
        }
    }

    if !policy.parent_deletion {
        return;
    }

    for dir in touched_dirs {
        ascend_and_remove_if_empty(dir, &source_root, policy.parent_levels, policy.force_delete_nonempty);
    }
}

fn ascend_and_remove_if_empty(mut dir: PathBuf, source_root: &Path, mut levels: u32, force: bool) {
    loop {
        if levels == 0 || !dir.starts_with(source_root) || dir == *source_root {
            return;
        }
        let is_empty = std::fs::read_dir(&dir).map(|mut it| it.next().is_none()).unwrap_or(false);
        if is_empty || force {
            if std::fs::remove_dir(&dir).is_err() && !force {
                return;
            }
            let parent = match dir.parent() {
                Some(p) => p.to_path_buf(),
                None => return,
            };
            dir = parent;
            levels -= 1;
        } else {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeletePolicy, RuleFlags, SizeFilter, SuffixFilter, SuffixMode, SyncTask};

    fn base_task(src: &Path, dst: &Path) -> SyncTask {
        SyncTask {
            id: "t1".into(),
            name: "T1".into(),
            source_path: src.display().to_string(),
            target_path: dst.display().to_string(),
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
        }
    }

    #[test]
    fn suffix_exclude_filters_matching_extension() {
        let filter = SuffixFilter {
            mode: SuffixMode::Exclude,
            extensions: vec!["nfo".into()],
        };
        assert!(!passes_filters(Path::new("a.nfo"), 10, &filter, &SizeFilter::default()));
        assert!(passes_filters(Path::new("a.mkv"), 10, &filter, &SizeFilter::default()));
    }

    #[test]
    fn extensionless_include_requires_empty_string_entry() {
        let filter = SuffixFilter {
            mode: SuffixMode::Include,
            extensions: vec!["".into()],
        };
        assert!(passes_filters(Path::new("README"), 10, &filter, &SizeFilter::default()));
    }

    #[test]
    fn size_filter_includes_exact_max_bound() {
        let filter = SizeFilter {
            min_bytes: None,
            max_bytes: Some(100),
        };
        assert!(filter.admits(100));
        assert!(!filter.admits(101));
    }

    #[test]
    fn union_of_no_rules_behaves_as_rule_not_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing.mkv");
        let rules = RuleFlags::default();
        assert!(should_copy(&rules, &target, 10, Utc::now()));
    }

    #[tokio::test]
    async fn run_copies_new_file_then_skips_on_second_pass() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("a.mkv"), vec![0u8; 1024]).unwrap();

        let task = base_task(src_dir.path(), dst_dir.path());
        let runtime_state = Arc::new(TaskRuntimeRegistry::default());
        let log = Arc::new(crate::log_ring::LogRingRegistry::new());

        let worker = SyncWorker {
            task: &task,
            cancellation: CancellationToken::new(),
            runtime_state: runtime_state.clone(),
            log: log.clone(),
            retry_count: 3,
            stability_delay: Duration::from_millis(0),
        };

        let outcome = worker.run(RunKind::Normal, SyncCache::default()).await;
        assert_eq!(outcome.stats.total, 1);
        assert_eq!(outcome.stats.success, 1);

        let worker2 = SyncWorker {
            task: &task,
            cancellation: CancellationToken::new(),
            runtime_state,
            log,
            retry_count: 3,
            stability_delay: Duration::from_millis(0),
        };
        let outcome2 = worker2.run(RunKind::Normal, outcome.cache).await;
        assert_eq!(outcome2.stats.success, 0);
        assert_eq!(outcome2.stats.skipped, 1);
    }

    #[tokio::test]
    async fn target_path_blocked_by_a_file_is_fatal_unwritable() {
        let src_dir = tempfile::tempdir().unwrap();
        let parent_dir = tempfile::tempdir().unwrap();
        // A plain file sitting where the target directory needs to be
        // created makes `create_dir_all` fail.
        let target = parent_dir.path().join("not-a-dir");
        std::fs::write(&target, b"occupied").unwrap();

        let task = base_task(src_dir.path(), &target);
        let worker = SyncWorker {
            task: &task,
            cancellation: CancellationToken::new(),
            runtime_state: Arc::new(TaskRuntimeRegistry::default()),
            log: Arc::new(crate::log_ring::LogRingRegistry::new()),
            retry_count: 3,
            stability_delay: Duration::from_millis(0),
        };

        let outcome = worker.run(RunKind::Normal, SyncCache::default()).await;
        assert!(matches!(outcome.fatal, Some(CloudGatherError::TargetUnwritable(_))));
    }
}
