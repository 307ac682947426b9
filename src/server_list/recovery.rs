//! Rebuilding the server list from the durable log.
//!
//! Replay walks the live records in append order and re-runs the
//! in-memory half of the operation each record persisted. The version
//! checkpoint is
//! applied first so every handler can tell whether its record's update
//! was published before the crash: a record stamped with a version above
//! the checkpoint belongs to the operation the crash interrupted, and its
//! rows are re-staged and re-published once replay finishes. Per-server
//! verified and update versions restart at zero (or at the REMOVE version
//! for removed entries), so the updater re-sends full lists to the whole
//! cluster afterwards.

use std::collections::HashMap;

use tracing::debug;
use tracing::info;
use tracing::warn;

use super::entry::Entry;
use super::entry::Slot;
use super::ops;
use super::CoordinatorServerList;
use super::Inner;
use crate::constants::UNASSIGNED_REPLICATION_ID;
use crate::durable_log::EntryId;
use crate::durable_log::LogRecord;
use crate::durable_log::ServerCrashInfo;
use crate::durable_log::ServerInformation;
use crate::durable_log::ServerReplicationUpdate;
use crate::durable_log::ServerUpdate;
use crate::error::CoordinatorError;
use crate::proto::ServerListUpdate;
use crate::proto::UpdateKind;
use crate::tracker::ServerChange;

impl CoordinatorServerList {
    /// Rebuild in-memory state from the durable log of a previous
    /// coordinator incarnation.
    ///
    /// Call after construction and before [`CoordinatorServerList::start_updater`].
    /// Trackers registered beforehand receive the reconstructed
    /// membership as a fresh sequence of events. If the crash interrupted
    /// an operation between persisting its intent and publishing it, the
    /// interrupted update is re-staged and published before this returns.
    pub fn recover(&self) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock();
        let records = self.log.replay()?;

        // Apply the version checkpoint first: handlers compare their
        // record's publication version against it.
        for (entry_id, record) in &records {
            if let LogRecord::ServerListVersion(state) = record {
                inner.version = state.version;
                inner.log_id_list_version = Some(*entry_id);
            }
        }
        info!(
            records = records.len(),
            version = inner.version,
            "replaying coordinator log"
        );

        for (entry_id, record) in records {
            match record {
                LogRecord::ServerInformation(state) => {
                    self.recover_server_up(&mut inner, state, entry_id);
                }
                LogRecord::ServerCrashed(state) => {
                    self.recover_server_crashed(&mut inner, state, entry_id);
                }
                LogRecord::ServerNeedsRecovery(state) => {
                    self.recover_server_needs_recovery(&mut inner, state, entry_id);
                }
                LogRecord::ServerRemoveUpdate(state) => {
                    self.recover_server_remove_update(&mut inner, state, entry_id);
                }
                LogRecord::ServerUpdate(state) => {
                    self.recover_server_update(&mut inner, state, entry_id);
                }
                LogRecord::ServerReplicationUpdate(state) => {
                    self.recover_server_replication_update(&mut inner, state, entry_id);
                }
                LogRecord::ServerListVersion(_) => {}
                LogRecord::ServerUpUpdate => {
                    inner.log_id_up_update_marker = Some(entry_id);
                }
                LogRecord::ServerReplicationUpUpdate => {
                    inner.log_id_replication_up_update_marker = Some(entry_id);
                }
            }
        }

        self.repair_replication_groups(&mut inner)?;

        // Resume the operation the crash interrupted, if any.
        if !inner.pending.is_empty() {
            let published = self.push_update(&mut inner);
            ops::PersistServerListVersion {
                log: &*self.log,
                inner: &mut inner,
                version: published,
            }
            .execute()?;
            info!(
                version = published,
                "republished update interrupted by coordinator crash"
            );
        }
        self.clear_markers(&mut inner)?;

        // Per-server verified versions restarted at zero, so every member
        // will be served the full list. Seed the update log with a
        // snapshot pair at the recovered version so the updater has a
        // head to serve it from.
        if inner.version > 0 && inner.updates.is_empty() {
            let full = inner.snapshot();
            let incremental = ServerListUpdate {
                kind: UpdateKind::Incremental,
                version_number: inner.version,
                entries: Vec::new(),
            };
            inner.updates.append(incremental, full);
            debug!(version = inner.version, "update log seeded with recovered snapshot");
        }
        info!(
            servers = inner.slots.iter().filter(|s| s.entry.is_some()).count(),
            version = inner.version,
            "coordinator server list recovered"
        );
        Ok(())
    }

    /// Dissolve replication groups that replay left undersized.
    ///
    /// Groups only lose members through dissolution, which resets every
    /// survivor in the same operation, so an undersized group can only be
    /// the residue of an assignment or dissolution the crash interrupted
    /// mid-sequence. Dissolving it re-runs the interrupted operation:
    /// members return to the pool and full groups re-form from it.
    fn repair_replication_groups(&self, inner: &mut Inner) -> Result<(), CoordinatorError> {
        let mut group_sizes: HashMap<u64, usize> = HashMap::new();
        for entry in inner.slots.iter().filter_map(|s| s.entry.as_ref()) {
            if entry.is_backup() && entry.replication_id != UNASSIGNED_REPLICATION_ID {
                *group_sizes.entry(entry.replication_id).or_default() += 1;
            }
        }
        let undersized: Vec<u64> = group_sizes
            .into_iter()
            .filter(|(_, members)| *members < self.config.replication_group_size)
            .map(|(group, _)| group)
            .collect();
        let update_version = inner.version + 1;
        for group in undersized {
            warn!(replication_id = group, "dissolving replication group left undersized by replay");
            self.remove_replication_group(inner, group, update_version)?;
        }
        Ok(())
    }

    /// Reinstall an enlisted server. Its ADD is re-staged when the record
    /// says it was never published.
    fn recover_server_up(&self, inner: &mut Inner, state: ServerInformation, entry_id: EntryId) {
        let index = state.server_id.index() as usize;
        while inner.slots.len() <= index {
            inner.slots.push(Slot::default());
        }
        let slot = &mut inner.slots[index];
        slot.next_generation = slot
            .next_generation
            .max(state.server_id.generation().wrapping_add(1));
        let mut entry = Entry::new(
            state.server_id,
            state.service_locator.clone(),
            state.services,
            state.read_speed,
        );
        entry.log_id_server_up = Some(entry_id);
        inner.install(entry);
        if state.update_version.is_some_and(|v| v > inner.version) {
            inner.stage_add(state.server_id);
        } else {
            inner.notify_change(state.server_id, ServerChange::Add);
        }
        debug!(server_id = %state.server_id, "recovered alive server");
    }

    /// Reapply a crash. Its CRASH row is re-staged when the record says
    /// it was never published.
    fn recover_server_crashed(&self, inner: &mut Inner, state: ServerCrashInfo, entry_id: EntryId) {
        if inner.entry(state.server_id).is_none() {
            warn!(server_id = %state.server_id, "crash record for unknown server ignored");
            return;
        }
        if let Some(e) = inner.entry_mut(state.server_id) {
            e.log_id_server_crashed = Some(entry_id);
        }
        inner.set_status_crashed(state.server_id);
        if state.update_version.is_some_and(|v| v > inner.version) {
            inner.stage_crashed(state.server_id);
        } else {
            inner.notify_change(state.server_id, ServerChange::Crash);
        }
        debug!(server_id = %state.server_id, "recovered crashed server");
    }

    /// Restore the needs-recovery flag so the crashed server's recovery
    /// is restarted.
    fn recover_server_needs_recovery(
        &self,
        inner: &mut Inner,
        state: ServerCrashInfo,
        entry_id: EntryId,
    ) {
        if let Some(e) = inner.entry_mut(state.server_id) {
            e.log_id_server_needs_recovery = Some(entry_id);
            e.needs_recovery = true;
        }
    }

    /// Reapply a completed recovery. The REMOVE row is re-staged when the
    /// record says it was never published; otherwise the entry waits for
    /// the updater to confirm the removal cluster-wide and reclaim it.
    fn recover_server_remove_update(
        &self,
        inner: &mut Inner,
        state: ServerCrashInfo,
        entry_id: EntryId,
    ) {
        if inner.entry(state.server_id).is_none() {
            warn!(server_id = %state.server_id, "remove record for unknown server ignored");
            return;
        }
        let remove_version = state.update_version.unwrap_or(inner.version);
        if let Some(e) = inner.entry_mut(state.server_id) {
            e.log_id_server_remove_update = Some(entry_id);
            e.log_id_server_needs_recovery = None;
        }
        inner.set_removed(state.server_id, remove_version);
        if state.update_version.is_some_and(|v| v > inner.version) {
            inner.stage_removed(state.server_id);
        } else {
            inner.notify_change(state.server_id, ServerChange::Remove);
        }
        debug!(server_id = %state.server_id, "recovered removed server");
    }

    /// Restore coordinator-only recovery information.
    fn recover_server_update(&self, inner: &mut Inner, state: ServerUpdate, entry_id: EntryId) {
        if let Some(e) = inner.entry_mut(state.server_id) {
            e.log_id_server_update = Some(entry_id);
            e.master_recovery_info = state.master_recovery_info;
        }
    }

    /// Restore a replication assignment and keep the group id counter
    /// ahead of every recovered assignment. The attribute row is
    /// re-staged when the record says it was never published.
    fn recover_server_replication_update(
        &self,
        inner: &mut Inner,
        state: ServerReplicationUpdate,
        entry_id: EntryId,
    ) {
        inner.next_replication_id = inner.next_replication_id.max(state.replication_id + 1);
        if let Some(e) = inner.entry_mut(state.server_id) {
            e.log_id_server_replication_update = Some(entry_id);
            e.replication_id = state.replication_id;
        }
        if state.update_version > inner.version {
            inner.stage_attribute_update(state.server_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::durable_log::MemoryLog;
    use crate::id::ServerId;
    use crate::id::ServiceKind;
    use crate::id::ServiceMask;
    use crate::transport::MockTransport;

    fn member_mask() -> ServiceMask {
        ServiceMask::of(&[ServiceKind::Master, ServiceKind::Membership])
    }

    #[test]
    fn test_recover_from_empty_log_is_a_fresh_list() {
        let list = CoordinatorServerList::new(
            Arc::new(MockTransport::new()),
            Arc::new(MemoryLog::new()),
        );
        list.recover().unwrap();
        assert_eq!(list.version(), 0);
        assert!(list.entries().is_empty());
    }

    #[test]
    fn test_recovered_slot_never_reissues_a_live_generation() {
        let log = Arc::new(MemoryLog::new());
        let first = CoordinatorServerList::new(Arc::new(MockTransport::new()), log.clone());
        let id = first
            .enlist_server(ServerId::INVALID, member_mask(), 0, "tcp:host=a")
            .unwrap();

        let second = CoordinatorServerList::new(Arc::new(MockTransport::new()), log);
        second.recover().unwrap();
        second.server_crashed(id).unwrap();
        second.recovery_completed(id).unwrap();
        second.sync();
        second.halt_updater();
        let next = second
            .enlist_server(ServerId::INVALID, member_mask(), 0, "tcp:host=b")
            .unwrap();
        assert_eq!(next.index(), id.index());
        assert!(next.generation() > id.generation());
    }
}
