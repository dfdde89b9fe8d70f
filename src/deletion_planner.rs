//! Shared helper deciding whether a synced source file is due for deletion
//! (spec.md §4.6). Pure logic, no teacher counterpart — new module.

use crate::cache::SyncCacheEntry;
use crate::model::{DeletePolicy, DeleteTimeBase};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionDecision {
    pub delete: bool,
    pub ascend_levels: u32,
}

/// `base_instant`: `lastSyncInstant` for `SYNC_COMPLETE`, else
/// `fileCreateInstant`, falling back to mtime if creation time is
/// unavailable (DESIGN.md Open Question 4).
pub fn base_instant(policy: &DeletePolicy, entry: &SyncCacheEntry) -> DateTime<Utc> {
    match policy.time_base {
        DeleteTimeBase::SyncComplete => entry.last_sync.unwrap_or(entry.mtime),
        DeleteTimeBase::FileCreate => entry.file_create.unwrap_or(entry.mtime),
    }
}

/// Decides eligibility for a single synced cache entry. `parent_empty`
/// indicates whether the immediately enclosing directory would become
/// empty after this file is removed; `force` is the task's
/// `force_delete_nonempty` flag. The caller determines `parent_empty` once
/// it knows every sibling's decision.
pub fn plan(
    policy: &DeletePolicy,
    entry: &SyncCacheEntry,
    now: DateTime<Utc>,
    parent_empty_or_forced: bool,
) -> DeletionDecision {
    if !policy.enabled {
        return DeletionDecision {
            delete: false,
            ascend_levels: 0,
        };
    }

    let eligible = if policy.delay_days == 0 {
        true
    } else {
        let base = base_instant(policy, entry);
        (now - base).num_days() >= policy.delay_days as i64
    };

    if !eligible {
        return DeletionDecision {
            delete: false,
            ascend_levels: 0,
        };
    }

    let ascend_levels = if policy.parent_deletion && parent_empty_or_forced {
        policy.parent_levels
    } else {
        0
    };

    DeletionDecision {
        delete: true,
        ascend_levels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SyncEntryStatus;
    use chrono::Duration;

    fn entry(last_sync: DateTime<Utc>) -> SyncCacheEntry {
        SyncCacheEntry {
            size: 10,
            mtime: last_sync,
            last_sync: Some(last_sync),
            file_create: None,
            status: SyncEntryStatus::Synced,
        }
    }

    #[test]
    fn disabled_policy_never_deletes() {
        let policy = DeletePolicy {
            enabled: false,
            ..Default::default()
        };
        let now = Utc::now();
        let decision = plan(&policy, &entry(now), now, true);
        assert!(!decision.delete);
    }

    #[test]
    fn zero_delay_is_immediately_eligible() {
        let policy = DeletePolicy {
            enabled: true,
            delay_days: 0,
            ..Default::default()
        };
        let now = Utc::now();
        let decision = plan(&policy, &entry(now), now, true);
        assert!(decision.delete);
    }

    #[test]
    fn positive_delay_blocks_until_elapsed() {
        let policy = DeletePolicy {
            enabled: true,
            delay_days: 7,
            ..Default::default()
        };
        let now = Utc::now();
        let recent = entry(now - Duration::days(2));
        assert!(!plan(&policy, &recent, now, true).delete);

        let old = entry(now - Duration::days(8));
        assert!(plan(&policy, &old, now, true).delete);
    }

    #[test]
    fn ascend_levels_zero_unless_parent_deletion_and_empty() {
        let policy = DeletePolicy {
            enabled: true,
            delay_days: 0,
            parent_deletion: true,
            parent_levels: 2,
            ..Default::default()
        };
        let now = Utc::now();
        let e = entry(now);
        assert_eq!(plan(&policy, &e, now, false).ascend_levels, 0);
        assert_eq!(plan(&policy, &e, now, true).ascend_levels, 2);
    }
}
