//! Per-task persistent cache trees: the Sync-Tree Cache (spec.md §3) and
//! the STRM-Tree Cache with anti-mass-delete bookkeeping. One file per task
//! under `cache/<task-id>.json`, same write-then-rename discipline as the
//! task store.

use crate::atomic_write::write_atomic;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncEntryStatus {
    Synced,
    Skipped,
    Failed,
    Deleted,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCacheEntry {
    pub size: u64,
    pub mtime: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
    pub file_create: Option<DateTime<Utc>>,
    pub status: SyncEntryStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncCache {
    /// relative-path -> entry
    pub entries: HashMap<String, SyncCacheEntry>,
}

impl SyncCache {
    pub fn load(cache_dir: &Path, task_id: &str) -> Result<Self> {
        let path = cache_path(cache_dir, task_id);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, cache_dir: &Path, task_id: &str) -> Result<()> {
        let path = cache_path(cache_dir, task_id);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json)?;
        Ok(())
    }
}

fn cache_path(cache_dir: &Path, task_id: &str) -> PathBuf {
    cache_dir.join(format!("{task_id}.json"))
}

/// A single observed remote leaf in the STRM-tree cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrmLeaf {
    pub remote_path: String,
    pub local_strm_path: String,
    pub extra_files: Vec<String>,
    pub last_seen_scan: u64,
    /// Consecutive scans in which this leaf was absent from the remote
    /// listing. Reset to 0 on re-observation (spec.md §4.4).
    pub miss_count: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StrmCache {
    /// remote relative path -> leaf
    pub leaves: HashMap<String, StrmLeaf>,
    pub scan_count: u64,
}

impl StrmCache {
    pub fn load(cache_dir: &Path, task_id: &str) -> Result<Self> {
        let path = cache_path(cache_dir, task_id);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, cache_dir: &Path, task_id: &str) -> Result<()> {
        let path = cache_path(cache_dir, task_id);
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(&path, &json)?;
        Ok(())
    }

    /// Leaves present in the previous cache but not in `observed` this scan.
    pub fn missing<'a>(&'a self, observed: &'a std::collections::HashSet<String>) -> Vec<&'a str> {
        self.leaves
            .keys()
            .filter(|k| !observed.contains(*k))
            .map(|k| k.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sync_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SyncCache::default();
        cache.entries.insert(
            "a.mkv".into(),
            SyncCacheEntry {
                size: 100,
                mtime: Utc::now(),
                last_sync: Some(Utc::now()),
                file_create: None,
                status: SyncEntryStatus::Synced,
            },
        );
        cache.save(dir.path(), "t1").unwrap();
        let reloaded = SyncCache::load(dir.path(), "t1").unwrap();
        assert_eq!(reloaded.entries.len(), 1);
    }

    #[test]
    fn strm_cache_missing_detects_absent_leaves() {
        let mut cache = StrmCache::default();
        cache.leaves.insert(
            "Movies/a.mkv".into(),
            StrmLeaf {
                remote_path: "Movies/a.mkv".into(),
                local_strm_path: "Movies/a.strm".into(),
                extra_files: vec![],
                last_seen_scan: 1,
                miss_count: 0,
            },
        );
        let observed: HashSet<String> = HashSet::new();
        assert_eq!(cache.missing(&observed), vec!["Movies/a.mkv"]);
    }
}
