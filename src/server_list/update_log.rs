//! The ordered history of published server list updates.
//!
//! Each published version is an [`UpdatePair`]: the incremental diff that
//! created the version plus a full snapshot at that version. Pairs are
//! appended at the tail and pruned from the head, only ever at the ends,
//! under the coordinator lock. The updater traverses the middle without
//! the lock by following each pair's forward link, which is published
//! once at append time and never rewritten. Reclamation is by reference
//! count: a pruned head stays alive until the last in-flight reader drops
//! its handle, and the pruning policy guarantees no reader ever needs a
//! pair at or below the pruned version.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;

use crate::proto::ServerListUpdate;

/// One published version of the server list.
#[derive(Debug)]
pub(crate) struct UpdatePair {
    /// The version both bodies are stamped with.
    pub version: u64,
    /// The diff that created this version.
    pub incremental: ServerListUpdate,
    /// The complete list at this version.
    pub full: ServerListUpdate,
    /// Serialized size of `incremental`, cached for RPC size budgeting.
    pub incremental_len: usize,
    /// Serialized size of `full`, cached for RPC size budgeting.
    pub full_len: usize,
    next: OnceLock<Weak<UpdatePair>>,
}

impl UpdatePair {
    /// The pair for the next version, if it is still reachable.
    pub fn next(&self) -> Option<Arc<UpdatePair>> {
        self.next.get().and_then(Weak::upgrade)
    }
}

/// Version-contiguous deque of update pairs.
#[derive(Debug, Default)]
pub(crate) struct UpdateLog {
    pairs: VecDeque<Arc<UpdatePair>>,
}

impl UpdateLog {
    /// Append the pair for a new version at the tail and link it from the
    /// previous tail.
    pub fn append(&mut self, incremental: ServerListUpdate, full: ServerListUpdate) {
        let pair = Arc::new(UpdatePair {
            version: incremental.version_number,
            incremental_len: incremental.encoded_len(),
            full_len: full.encoded_len(),
            incremental,
            full,
            next: OnceLock::new(),
        });
        if let Some(tail) = self.pairs.back() {
            let _ = tail.next.set(Arc::downgrade(&pair));
        }
        self.pairs.push_back(pair);
    }

    /// The oldest retained pair.
    pub fn head(&self) -> Option<Arc<UpdatePair>> {
        self.pairs.front().cloned()
    }

    /// The pair for `version`, if retained. Versions are contiguous, so
    /// this is a direct offset from the head.
    pub fn get(&self, version: u64) -> Option<Arc<UpdatePair>> {
        let head = self.pairs.front()?;
        let offset = version.checked_sub(head.version)?;
        self.pairs.get(usize::try_from(offset).ok()?).cloned()
    }

    /// Pop pairs from the head while their version is at or below
    /// `min_confirmed`, returning how many were pruned.
    pub fn prune(&mut self, min_confirmed: u64) -> usize {
        let mut pruned = 0;
        while let Some(head) = self.pairs.front() {
            if head.version > min_confirmed {
                break;
            }
            self.pairs.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Number of retained pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pairs are retained.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(version: u64) -> ServerListUpdate {
        ServerListUpdate {
            version_number: version,
            ..Default::default()
        }
    }

    fn log_with_versions(versions: std::ops::RangeInclusive<u64>) -> UpdateLog {
        let mut log = UpdateLog::default();
        for v in versions {
            log.append(update(v), update(v));
        }
        log
    }

    #[test]
    fn test_get_is_offset_from_head() {
        let log = log_with_versions(5..=9);
        assert_eq!(log.get(5).unwrap().version, 5);
        assert_eq!(log.get(9).unwrap().version, 9);
        assert!(log.get(4).is_none());
        assert!(log.get(10).is_none());
    }

    #[test]
    fn test_links_traverse_in_version_order() {
        let log = log_with_versions(1..=4);
        let mut cursor = log.head();
        let mut seen = Vec::new();
        while let Some(pair) = cursor {
            seen.push(pair.version);
            cursor = pair.next();
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_tail_link_is_set_by_later_append() {
        let mut log = log_with_versions(1..=1);
        let head = log.head().unwrap();
        assert!(head.next().is_none());
        log.append(update(2), update(2));
        assert_eq!(head.next().unwrap().version, 2);
    }

    #[test]
    fn test_prune_pops_only_the_confirmed_prefix() {
        let mut log = log_with_versions(1..=6);
        assert_eq!(log.prune(3), 3);
        assert_eq!(log.head().unwrap().version, 4);
        assert_eq!(log.prune(0), 0);
        assert_eq!(log.prune(u64::MAX), 3);
        assert!(log.is_empty());
    }

    #[test]
    fn test_held_reader_keeps_pruned_pair_alive() {
        let mut log = log_with_versions(1..=3);
        let held = log.get(1).unwrap();
        log.prune(1);
        // The pruned pair stays alive through the reader's handle and
        // still links forward into the retained portion of the log.
        assert_eq!(held.version, 1);
        assert_eq!(held.next().map(|p| p.version), Some(2));
        assert_eq!(log.head().unwrap().version, 2);
    }

    #[test]
    fn test_link_into_fully_pruned_range_goes_dead() {
        let mut log = log_with_versions(1..=3);
        let held = log.get(1).unwrap();
        log.prune(2);
        // Version 2 lost its last strong reference; a reader that raced
        // past the pruning point observes the end of the chain instead.
        assert!(held.next().is_none());
    }
}
