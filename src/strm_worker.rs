//! STRM Worker (spec.md §4.4): crawls a remote OpenList-exposed tree,
//! writes `.strm` pointer files plus selected metadata locally, and
//! maintains a tree cache with bidirectional incremental deletion and an
//! anti-mass-delete safeguard.
//!
//! Same worker-pool shape as `sync_worker`, generalized to consume an
//! `OpenListClient` instead of walking the local filesystem for its
//! source side.

use crate::atomic_write::write_atomic_async;
use crate::cache::{StrmCache, StrmLeaf};
use crate::error::{CloudGatherError, Result};
use crate::model::{StatsSnapshot, StrmMode, StrmTask, TaskRuntimeRegistry};
use crate::openlist_client::{ListEntry, OpenListClient};
use crate::settings::{ExtensionClass, ExtensionClasses};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Normal,
    FullOverwrite,
    Reconstruct,
}

pub struct StrmWorkerOutcome {
    pub stats: StatsSnapshot,
    pub cache: StrmCache,
    pub protection_warning: Option<String>,
    pub fatal: Option<CloudGatherError>,
}

struct RemoteFile {
    remote_path: String,
    entry: ListEntry,
}

/// Paginated recursive listing of the remote tree (spec.md §4.4: request
/// one page at a time, page size ~100; recurse into directories).
async fn crawl_remote(
    client: &OpenListClient,
    root: &str,
    wait_time: Duration,
    cancellation: &CancellationToken,
) -> Result<Vec<RemoteFile>> {
    let mut stack = vec![root.to_string()];
    let mut files = Vec::new();

    while let Some(dir) = stack.pop() {
        if cancellation.is_cancelled() {
            break;
        }
        let mut page = 1u32;
        loop {
            let (entries, _total) = client.list(&dir, page, 100).await?;
            let page_len = entries.len();
            for entry in entries {
                let remote_path = join_remote(&dir, &entry.name);
                if entry.is_dir {
                    stack.push(remote_path);
                } else {
                    files.push(RemoteFile { remote_path, entry });
                }
            }
            if page_len < 100 {
                break;
            }
            page += 1;
            if wait_time > Duration::ZERO {
                tokio::time::sleep(wait_time).await;
            }
        }
    }

    Ok(files)
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn strm_content(mode: StrmMode, client: &OpenListClient, public_base: Option<&str>, entry: &RemoteFile) -> String {
    match mode {
        StrmMode::AlistUrl => client.alist_url(public_base, &entry.remote_path, &entry.entry.sign),
        StrmMode::RawUrl => entry
            .entry
            .raw_url
            .clone()
            .unwrap_or_else(|| client.alist_url(public_base, &entry.remote_path, &entry.entry.sign)),
        StrmMode::AlistPath => entry.remote_path.clone(),
    }
}

fn local_path_for(target_dir: &Path, remote_path: &str, root: &str, new_ext: &str) -> PathBuf {
    let rel = remote_path.strip_prefix(root).unwrap_or(remote_path).trim_start_matches('/');
    let rel_path = Path::new(rel);
    let stem = rel_path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let dir = rel_path.parent().unwrap_or(Path::new(""));
    target_dir.join(dir).join(format!("{stem}.{new_ext}"))
}

fn local_extra_path(target_dir: &Path, remote_path: &str, root: &str) -> PathBuf {
    let rel = remote_path.strip_prefix(root).unwrap_or(remote_path).trim_start_matches('/');
    target_dir.join(rel)
}

pub struct StrmWorker<'a> {
    pub task: &'a StrmTask,
    pub client: Arc<OpenListClient>,
    pub extensions: ExtensionClasses,
    pub public_base: Option<String>,
    pub cancellation: CancellationToken,
    pub runtime_state: Arc<TaskRuntimeRegistry>,
    pub log: Arc<crate::log_ring::LogRingRegistry>,
}

impl<'a> StrmWorker<'a> {
    pub async fn run(&self, kind: RunKind, mut cache: StrmCache) -> StrmWorkerOutcome {
        let target_dir = PathBuf::from(&self.task.target_dir);
        let wait_time = Duration::from_secs(self.task.wait_time_secs as u64);

        if let Err(e) = std::fs::create_dir_all(&target_dir) {
            return StrmWorkerOutcome {
                stats: StatsSnapshot::default(),
                cache,
                protection_warning: None,
                fatal: Some(CloudGatherError::TargetUnwritable(format!("{}: {e}", target_dir.display()))),
            };
        }

        let remote_files = match crawl_remote(&self.client, &self.task.source_dir, wait_time, &self.cancellation).await {
            Ok(v) => v,
            Err(e) => {
                return StrmWorkerOutcome {
                    stats: StatsSnapshot::default(),
                    cache,
                    protection_warning: None,
                    fatal: Some(e),
                };
            }
        };

        if kind == RunKind::FullOverwrite || kind == RunKind::Reconstruct {
            cache = StrmCache::default();
        }
        cache.scan_count += 1;
        let scan = cache.scan_count;

        let total = remote_files.len() as u64;
        self.runtime_state.update_progress(&self.task.id, |p| {
            p.total = total;
            p.done = 0;
        });

        let success = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicU64::new(0));
        let observed: Arc<parking_lot::Mutex<HashSet<String>>> = Arc::new(parking_lot::Mutex::new(HashSet::new()));
        let leaf_updates: Arc<parking_lot::Mutex<Vec<(String, StrmLeaf)>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.task.effective_max_workers() as usize));
        let mut join_set = tokio::task::JoinSet::new();

        for remote in remote_files {
            if self.cancellation.is_cancelled() {
                break;
            }
            let ext = extension_of(&remote.entry.name);
            let class = self.extensions.classify(&ext);

            let is_video = matches!(class, ExtensionClass::Video);
            let wants_extra = match class {
                ExtensionClass::Subtitle => self.task.extra_files.subtitle,
                ExtensionClass::Image => self.task.extra_files.image,
                ExtensionClass::Nfo => self.task.extra_files.nfo,
                _ => false,
            };

            if !is_video && !wants_extra {
                skipped.fetch_add(1, Ordering::Relaxed);
                done.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            observed.lock().insert(remote.remote_path.clone());

            let permit = semaphore.clone();
            let client = self.client.clone();
            let mode = self.task.mode;
            let public_base = self.public_base.clone();
            let source_root = self.task.source_dir.clone();
            let target_dir = target_dir.clone();
            let success = success.clone();
            let skipped_counter = skipped.clone();
            let failed = failed.clone();
            let done = done.clone();
            let runtime_state = self.runtime_state.clone();
            let task_id = self.task.id.clone();
            let log = self.log.clone();
            let leaf_updates = leaf_updates.clone();
            let overwrite = kind == RunKind::FullOverwrite;
            let reconstruct = kind == RunKind::Reconstruct;

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.ok();

                let result = if reconstruct {
                    reconstruct_leaf(&target_dir, &remote, &source_root)
                } else if is_video {
                    write_strm_leaf(&client, mode, public_base.as_deref(), &target_dir, &remote, &source_root, overwrite).await
                } else {
                    write_extra_file(&client, &target_dir, &remote, &source_root, overwrite).await
                };

                match result {
                    Ok(Some(leaf)) => {
                        success.fetch_add(1, Ordering::Relaxed);
                        leaf_updates.lock().push((remote.remote_path.clone(), leaf));
                    }
                    Ok(None) => {
                        skipped_counter.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        log.push(&task_id, "WARN", format!("strm write failed for {}: {e}", remote.remote_path));
                    }
                }

                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                runtime_state.update_progress(&task_id, |p| {
                    p.done = n;
                    p.success = success.load(Ordering::Relaxed);
                    p.skipped = skipped_counter.load(Ordering::Relaxed);
                    p.failed = failed.load(Ordering::Relaxed);
                });
            });
        }

        while join_set.join_next().await.is_some() {}

        for (remote_path, leaf) in leaf_updates.lock().drain(..) {
            cache.leaves.insert(remote_path, leaf);
        }

        let observed = observed.lock();
        let protection_warning = self.run_deletion_phase(&mut cache, &observed, scan);
        drop(observed);

        if self.task.sync_local_delete && self.cancellation.is_cancelled() == false {
            self.sync_local_deletions(&cache).await;
        }

        let stats = StatsSnapshot {
            total,
            success: success.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            filtered: 0,
        };

        StrmWorkerOutcome {
            stats,
            cache,
            protection_warning,
            fatal: None,
        }
    }

    /// Anti-mass-delete: compute `missing`, abort the delete phase if it
    /// exceeds `threshold` while `sync_server_delete` is set, otherwise
    /// increment `miss_count` and prune leaves past `grace_scans`
    /// (spec.md §3 STRM-Tree Cache invariants, §4.4). Re-observed leaves
    /// have `miss_count` reset to 0 and `last_seen_scan` stamped with the
    /// current scan, so `miss_count` always counts *consecutive* misses.
    fn run_deletion_phase(&self, cache: &mut StrmCache, observed: &HashSet<String>, scan: u64) -> Option<String> {
        for path in observed {
            if let Some(leaf) = cache.leaves.get_mut(path) {
                leaf.miss_count = 0;
                leaf.last_seen_scan = scan;
            }
        }

        let missing: Vec<String> = cache.missing(observed).into_iter().map(|s| s.to_string()).collect();
        let threshold = self.task.smart_protection.threshold;

        if self.task.sync_server_delete && missing.len() > threshold {
            let msg = CloudGatherError::ProtectionTripped {
                missing: missing.len(),
                threshold,
            }
            .to_string();
            self.log.push(&self.task.id, "WARN", msg.clone());
            return Some(msg);
        }

        for path in &missing {
            if let Some(leaf) = cache.leaves.get_mut(path) {
                leaf.miss_count += 1;
            }
        }

        let grace = self.task.smart_protection.grace_scans;
        let to_prune: Vec<String> = cache
            .leaves
            .iter()
            .filter(|(_, leaf)| leaf.miss_count >= grace)
            .map(|(k, _)| k.clone())
            .collect();

        for path in to_prune {
            if let Some(leaf) = cache.leaves.remove(&path) {
                let _ = std::fs::remove_file(&leaf.local_strm_path);
                for extra in &leaf.extra_files {
                    let _ = std::fs::remove_file(extra);
                }
            }
        }

        None
    }

    /// Local-to-remote deletion (spec.md §4.4): if the local `.strm` is
    /// missing and the suffix filter admits the remote source file,
    /// request remote deletion.
    async fn sync_local_deletions(&self, cache: &StrmCache) {
        for (remote_path, leaf) in cache.leaves.iter() {
            let local_missing = match std::fs::symlink_metadata(&leaf.local_strm_path) {
                Ok(_) => false,
                Err(_) => true,
            };
            if !local_missing {
                continue;
            }
            let ext = extension_of(remote_path);
            if !self.task.suffix_filter.admits(&ext) {
                continue;
            }
            let (dir, name) = split_remote(remote_path);
            if let Err(e) = self.client.delete(&dir, std::slice::from_ref(&name)).await {
                self.log
                    .push(&self.task.id, "WARN", format!("remote delete failed for {remote_path}: {e}"));
            }
        }
    }
}

fn split_remote(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => (String::new(), path.to_string()),
    }
}

async fn write_strm_leaf(
    client: &OpenListClient,
    mode: StrmMode,
    public_base: Option<&str>,
    target_dir: &Path,
    remote: &RemoteFile,
    source_root: &str,
    overwrite: bool,
) -> Result<Option<StrmLeaf>> {
    let local_path = local_path_for(target_dir, &remote.remote_path, source_root, "strm");
    let content = strm_content(mode, client, public_base, remote);

    if !overwrite {
        if let Ok(existing) = tokio::fs::read_to_string(&local_path).await {
            if existing == content {
                return Ok(None);
            }
        }
    }

    write_atomic_async(&local_path, content.into_bytes())
        .await
        .map_err(|e| CloudGatherError::io(local_path.display().to_string(), e))?;

    Ok(Some(StrmLeaf {
        remote_path: remote.remote_path.clone(),
        local_strm_path: local_path.display().to_string(),
        extra_files: Vec::new(),
        last_seen_scan: 0, // stamped with the current scan in run_deletion_phase
        miss_count: 0,
    }))
}

async fn write_extra_file(
    client: &OpenListClient,
    target_dir: &Path,
    remote: &RemoteFile,
    source_root: &str,
    overwrite: bool,
) -> Result<Option<StrmLeaf>> {
    let local_path = local_extra_path(target_dir, &remote.remote_path, source_root);

    if !overwrite && local_path.exists() {
        return Ok(None);
    }

    let full_entry = client.get(&remote.remote_path).await?;
    let download_url = full_entry
        .raw_url
        .clone()
        .unwrap_or_else(|| client.alist_url(None, &remote.remote_path, &full_entry.sign));

    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CloudGatherError::io(parent.display().to_string(), e))?;
    }
    let part_path = crate::atomic_write::part_path_for(&local_path);
    let mut file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| CloudGatherError::io(part_path.display().to_string(), e))?;
    client.download(&download_url, &mut file).await?;
    drop(file);
    tokio::fs::rename(&part_path, &local_path)
        .await
        .map_err(|e| CloudGatherError::io(local_path.display().to_string(), e))?;

    Ok(Some(StrmLeaf {
        remote_path: remote.remote_path.clone(),
        local_strm_path: local_path.display().to_string(),
        extra_files: vec![local_path.display().to_string()],
        last_seen_scan: 0, // stamped with the current scan in run_deletion_phase
        miss_count: 0,
    }))
}

fn reconstruct_leaf(target_dir: &Path, remote: &RemoteFile, source_root: &str) -> Result<Option<StrmLeaf>> {
    let local_path = local_path_for(target_dir, &remote.remote_path, source_root, "strm");
    if local_path.exists() {
        Ok(Some(StrmLeaf {
            remote_path: remote.remote_path.clone(),
            local_strm_path: local_path.display().to_string(),
            extra_files: Vec::new(),
            last_seen_scan: 0, // stamped with the current scan in run_deletion_phase
            miss_count: 0,
        }))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_for_strips_source_root_and_swaps_extension() {
        let target = Path::new("/data/strm");
        let entry = RemoteFile {
            remote_path: "/Movies/Alien/alien.mkv".into(),
            entry: ListEntry {
                name: "alien.mkv".into(),
                size: 100,
                is_dir: false,
                modified: None,
                sign: String::new(),
                raw_url: None,
            },
        };
        let path = local_path_for(target, &entry.remote_path, "/Movies", "strm");
        assert_eq!(path, Path::new("/data/strm/Alien/alien.strm"));
    }

    #[test]
    fn split_remote_separates_dir_and_name() {
        assert_eq!(split_remote("/Movies/a.mkv"), ("/Movies".to_string(), "a.mkv".to_string()));
        assert_eq!(split_remote("a.mkv"), (String::new(), "a.mkv".to_string()));
    }

    #[test]
    fn miss_count_resets_on_reobservation_so_only_consecutive_misses_count() {
        use crate::model::{ExtraFileFlags, SmartProtection, SuffixFilter};

        let task = StrmTask {
            id: "t1".into(),
            name: "T1".into(),
            source_dir: "/Movies".into(),
            target_dir: "/data/strm".into(),
            cron: "0 0 * * *".into(),
            mode: StrmMode::AlistPath,
            extra_files: ExtraFileFlags::default(),
            max_workers: 4,
            wait_time_secs: 0,
            sync_server_delete: false,
            sync_local_delete: false,
            suffix_filter: SuffixFilter::default(),
            smart_protection: SmartProtection {
                threshold: 100,
                grace_scans: 3,
            },
            enabled: true,
            last_run: None,
            next_run: None,
        };

        let conn = crate::settings::OpenListConnection::default();
        let client = Arc::new(OpenListClient::new(&conn, false).unwrap());
        let worker = StrmWorker {
            task: &task,
            client,
            extensions: crate::settings::ExtensionClasses::default(),
            public_base: None,
            cancellation: CancellationToken::new(),
            runtime_state: Arc::new(TaskRuntimeRegistry::default()),
            log: Arc::new(crate::log_ring::LogRingRegistry::new()),
        };

        let mut cache = StrmCache::default();
        cache.leaves.insert(
            "Movies/a.mkv".into(),
            StrmLeaf {
                remote_path: "Movies/a.mkv".into(),
                local_strm_path: "/data/strm/a.strm".into(),
                extra_files: vec![],
                last_seen_scan: 0,
                miss_count: 0,
            },
        );

        let absent: HashSet<String> = HashSet::new();
        let mut present: HashSet<String> = HashSet::new();
        present.insert("Movies/a.mkv".to_string());

        // Scan 1: absent -> miss_count 1.
        worker.run_deletion_phase(&mut cache, &absent, 1);
        assert_eq!(cache.leaves["Movies/a.mkv"].miss_count, 1);

        // Scan 2: present and unchanged -> reset to 0, not pruned.
        worker.run_deletion_phase(&mut cache, &present, 2);
        assert_eq!(cache.leaves["Movies/a.mkv"].miss_count, 0);
        assert_eq!(cache.leaves["Movies/a.mkv"].last_seen_scan, 2);

        // Scan 3: absent again -> 1 (not accumulating from before the reset).
        worker.run_deletion_phase(&mut cache, &absent, 3);
        assert_eq!(cache.leaves["Movies/a.mkv"].miss_count, 1);

        // Scan 4: present -> reset to 0 again.
        worker.run_deletion_phase(&mut cache, &present, 4);
        assert_eq!(cache.leaves["Movies/a.mkv"].miss_count, 0);

        // Scan 5: absent -> 1, still short of grace_scans=3 consecutive
        // misses, so the leaf survives.
        worker.run_deletion_phase(&mut cache, &absent, 5);
        assert!(cache.leaves.contains_key("Movies/a.mkv"));
        assert_eq!(cache.leaves["Movies/a.mkv"].miss_count, 1);
    }

    #[test]
    fn protection_trips_when_missing_exceeds_threshold() {
        let mut cache = StrmCache::default();
        for i in 0..500 {
            cache.leaves.insert(
                format!("Movies/{i}.mkv"),
                StrmLeaf {
                    remote_path: format!("Movies/{i}.mkv"),
                    local_strm_path: format!("/data/{i}.strm"),
                    extra_files: vec![],
                    last_seen_scan: 1,
                    miss_count: 0,
                },
            );
        }
        let observed: HashSet<String> = HashSet::new();
        let missing = cache.missing(&observed);
        assert_eq!(missing.len(), 500);
        assert!(missing.len() > 100);
    }
}
