//! The coordinator server list.
//!
//! [`CoordinatorServerList`] is the authoritative, cluster-wide registry
//! of servers in an Alder cluster. It allocates server ids with
//! generational reuse, tracks per-server state on the coordinator's
//! behalf, persists every membership change to a durable log before
//! making it visible, and drives a background updater that propagates
//! changes to every live server.
//!
//! ## Structure
//!
//! - `entry`: per-server state and the slot table
//! - `update_log`: the published history of list versions
//! - `updater`: the background propagation engine
//! - `ops`: persist-then-mutate operation descriptors
//! - `recovery`: log replay after a coordinator crash
//!
//! ## Locking
//!
//! One mutex guards the slot table, the staged diff, the list version,
//! and the ends of the update log. Mutating calls hold it for their full
//! duration; the updater releases it across each outbound RPC and
//! traverses the middle of the update log without it. User threads block
//! only on the two condition variables (`has_updates_or_stop`,
//! `list_up_to_date`).

mod entry;
mod ops;
mod recovery;
mod update_log;
mod updater;

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use entry::Entry;
pub(crate) use entry::Slot;
pub(crate) use update_log::UpdateLog;
pub(crate) use updater::ScanMetadata;

use crate::constants::MAX_RPC_PAYLOAD_BYTES;
use crate::constants::MAX_SERVER_SLOTS;
use crate::constants::MAX_UPDATES_PER_RPC;
use crate::constants::REPLICATION_GROUP_SIZE;
use crate::constants::UNASSIGNED_REPLICATION_ID;
use crate::durable_log::CoordinationLog;
use crate::durable_log::EntryId;
use crate::error::CoordinatorError;
use crate::error::EnlistmentConflictSnafu;
use crate::error::NoSuchServerSnafu;
use crate::error::ServerNotCrashedSnafu;
use crate::error::ServerNotUpSnafu;
use crate::error::SlotTableFullSnafu;
use crate::id::ServerId;
use crate::id::ServiceKind;
use crate::id::ServiceMask;
use crate::proto::ServerListEntry;
use crate::proto::ServerListUpdate;
use crate::proto::ServerStatus;
use crate::proto::UpdateKind;
use crate::tracker::ServerChange;
use crate::tracker::ServerChangeEvent;
use crate::tracker::ServerTracker;
use crate::transport::MembershipTransport;

/// Tunables for the coordinator server list.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum incremental updates batched into one RPC.
    pub max_updates_per_rpc: u64,
    /// Maximum serialized size of one outgoing update RPC.
    pub max_rpc_payload_bytes: usize,
    /// Backups per replication group.
    pub replication_group_size: usize,
    /// Bound on the slot table.
    pub max_server_slots: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_updates_per_rpc: MAX_UPDATES_PER_RPC,
            max_rpc_payload_bytes: MAX_RPC_PAYLOAD_BYTES,
            replication_group_size: REPLICATION_GROUP_SIZE,
            max_server_slots: MAX_SERVER_SLOTS,
        }
    }
}

/// Membership changes staged since the last publication.
///
/// Removals and crashes are kept apart from additions so a published diff
/// always orders them first: a re-enlisting server is observed by every
/// consumer as "old id gone, new id present", never the reverse.
#[derive(Debug, Default)]
pub(crate) struct PendingDiff {
    removals: Vec<ServerListEntry>,
    additions: Vec<ServerListEntry>,
}

impl PendingDiff {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }

    /// Drain the staged rows into one update: removals first, then adds.
    pub fn take_update(&mut self, version: u64) -> ServerListUpdate {
        let mut entries = std::mem::take(&mut self.removals);
        entries.append(&mut self.additions);
        ServerListUpdate {
            kind: UpdateKind::Incremental,
            version_number: version,
            entries,
        }
    }
}

/// State guarded by the coordinator lock.
pub(crate) struct Inner {
    /// The slot table.
    pub slots: Vec<Slot>,
    /// Serving masters.
    pub num_masters: u32,
    /// Serving backups.
    pub num_backups: u32,
    /// Version of the most recently published update.
    pub version: u64,
    /// Changes staged for the next publication.
    pub pending: PendingDiff,
    /// Published history, pruned from the old end.
    pub updates: UpdateLog,
    /// Oldest list version any update-accepting server may still hold.
    /// Recomputed lazily at full-scan boundaries; safe for pruning.
    pub min_confirmed_version: u64,
    /// Servers with an update RPC currently assigned.
    pub num_updating_servers: u32,
    /// Next replication group id; starts at 1, never reused.
    pub next_replication_id: u64,
    /// Tells the updater thread to exit. Toggled only through
    /// `start_updater` / `halt_updater`.
    pub stop_updater: bool,
    /// Resumable scan state of the updater.
    pub last_scan: ScanMetadata,
    /// Registered membership observers.
    pub trackers: Vec<Arc<dyn ServerTracker>>,
    /// Live checkpoint of the published list version.
    pub log_id_list_version: Option<EntryId>,
    /// Live "enlistment update pending" marker.
    pub log_id_up_update_marker: Option<EntryId>,
    /// Live "replication update pending" marker.
    pub log_id_replication_up_update_marker: Option<EntryId>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            slots: Vec::new(),
            num_masters: 0,
            num_backups: 0,
            version: 0,
            pending: PendingDiff::default(),
            updates: UpdateLog::default(),
            min_confirmed_version: 0,
            num_updating_servers: 0,
            next_replication_id: 1,
            stop_updater: false,
            last_scan: ScanMetadata::new(),
            trackers: Vec::new(),
            log_id_list_version: None,
            log_id_up_update_marker: None,
            log_id_replication_up_update_marker: None,
        }
    }

    /// The entry named by `id`, rejecting stale generations.
    pub fn entry(&self, id: ServerId) -> Option<&Entry> {
        let slot = self.slots.get(id.index() as usize)?;
        slot.entry.as_ref().filter(|e| e.server_id == id)
    }

    /// Mutable access to the entry named by `id`.
    pub fn entry_mut(&mut self, id: ServerId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        slot.entry.as_mut().filter(|e| e.server_id == id)
    }

    /// Reserve the lowest free slot, consuming one generation.
    ///
    /// A reservation is burned, not returned, if the enclosing operation
    /// later aborts; ids are never reissued.
    pub fn reserve_id(&mut self, limit: u32) -> Result<ServerId, CoordinatorError> {
        let index = match self.slots.iter().position(|s| s.entry.is_none()) {
            Some(index) => index,
            None => {
                if self.slots.len() >= limit as usize {
                    return SlotTableFullSnafu { limit }.fail();
                }
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        if slot.next_generation == 0 {
            slot.next_generation = 1;
        }
        let id = ServerId::new(index as u32, slot.next_generation);
        slot.next_generation = slot.next_generation.wrapping_add(1);
        Ok(id)
    }

    /// Place a fresh entry into its slot and account for its services.
    pub fn install(&mut self, entry: Entry) {
        let index = entry.server_id.index() as usize;
        if entry.is_master() {
            self.num_masters += 1;
        }
        if entry.is_backup() {
            self.num_backups += 1;
        }
        self.slots[index].entry = Some(entry);
    }

    /// Move an UP entry to CRASHED and stop counting its services.
    pub fn set_status_crashed(&mut self, id: ServerId) {
        let (was_master, was_backup) = match self.entry(id) {
            Some(e) => (e.is_master(), e.is_backup()),
            None => return,
        };
        if was_master {
            self.num_masters -= 1;
        }
        if was_backup {
            self.num_backups -= 1;
        }
        if let Some(e) = self.entry_mut(id) {
            e.status = ServerStatus::Crashed;
        }
    }

    /// Move a CRASHED entry to REMOVED. `remove_version` is the version
    /// its REMOVE update publishes under; the slot is reclaimed once the
    /// cluster confirms that version.
    pub fn set_removed(&mut self, id: ServerId, remove_version: u64) {
        if let Some(e) = self.entry_mut(id) {
            e.status = ServerStatus::Removed;
            e.needs_recovery = false;
            e.update_version = remove_version;
        }
    }

    /// Stage the entry's row as an addition and notify trackers.
    pub fn stage_add(&mut self, id: ServerId) {
        if let Some(wire) = self.entry(id).map(Entry::to_wire) {
            self.pending.additions.push(wire);
            self.notify_change(id, ServerChange::Add);
        }
    }

    /// Stage the entry's row as a crash and notify trackers.
    pub fn stage_crashed(&mut self, id: ServerId) {
        if let Some(wire) = self.entry(id).map(Entry::to_wire) {
            self.pending.removals.push(wire);
            self.notify_change(id, ServerChange::Crash);
        }
    }

    /// Stage the entry's row as a removal and notify trackers.
    pub fn stage_removed(&mut self, id: ServerId) {
        if let Some(wire) = self.entry(id).map(Entry::to_wire) {
            self.pending.removals.push(wire);
            self.notify_change(id, ServerChange::Remove);
        }
    }

    /// Stage the entry's current row as an attribute update. Attribute
    /// changes ride the addition bucket and are not membership events, so
    /// trackers are not notified.
    pub fn stage_attribute_update(&mut self, id: ServerId) {
        if let Some(wire) = self.entry(id).map(Entry::to_wire) {
            self.pending.additions.push(wire);
        }
    }

    /// Deliver one membership event to every tracker. Runs under the
    /// coordinator lock; callbacks must not reenter the server list.
    pub fn notify_change(&self, id: ServerId, change: ServerChange) {
        let Some(entry) = self.entry(id) else { return };
        let event = ServerChangeEvent {
            server_id: entry.server_id,
            service_locator: entry.service_locator.clone(),
            services: entry.services,
            change,
        };
        for tracker in &self.trackers {
            tracker.on_server_change(&event);
        }
    }

    /// Full snapshot of the list (UP and CRASHED entries) at the current
    /// version.
    pub fn snapshot(&self) -> ServerListUpdate {
        self.serialize_filtered(ServiceMask::of(&[
            ServiceKind::Master,
            ServiceKind::Backup,
            ServiceKind::Ping,
            ServiceKind::Membership,
        ]))
    }

    /// Snapshot restricted to entries running at least one service in
    /// `filter`.
    pub fn serialize_filtered(&self, filter: ServiceMask) -> ServerListUpdate {
        let entries = self
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.status != ServerStatus::Removed)
            .filter(|e| e.services.intersects(filter))
            .map(Entry::to_wire)
            .collect();
        ServerListUpdate {
            kind: UpdateKind::Full,
            version_number: self.version,
            entries,
        }
    }

    /// Whether every update-accepting server has confirmed the current
    /// version and no update RPC is outstanding.
    pub fn is_cluster_up_to_date(&self) -> bool {
        self.num_updating_servers == 0
            && self
                .slots
                .iter()
                .filter_map(|s| s.entry.as_ref())
                .all(|e| !e.accepts_updates() || e.verified_version == self.version)
    }
}

/// The coordinator's authoritative server list.
///
/// Thread-safe: mutating operations serialize on an internal lock, and a
/// dedicated updater thread (see [`CoordinatorServerList::start_updater`])
/// pushes published changes to every live server. Construction is
/// followed by [`CoordinatorServerList::recover`] when a durable log from
/// a previous incarnation exists.
///
/// `halt_updater` must be called before the last handle is dropped; the
/// updater thread holds a handle of its own, so the list cannot observe
/// its own drop while the thread runs.
pub struct CoordinatorServerList {
    pub(crate) inner: Mutex<Inner>,
    /// Signaled after each publication and when the updater must stop.
    pub(crate) has_updates_or_stop: Condvar,
    /// Signaled when the cluster becomes fully up to date.
    pub(crate) list_up_to_date: Condvar,
    pub(crate) transport: Arc<dyn MembershipTransport>,
    pub(crate) log: Arc<dyn CoordinationLog>,
    pub(crate) config: CoordinatorConfig,
    pub(crate) updater_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorServerList {
    /// Create an empty server list with default tunables.
    pub fn new(
        transport: Arc<dyn MembershipTransport>,
        log: Arc<dyn CoordinationLog>,
    ) -> Arc<Self> {
        Self::with_config(transport, log, CoordinatorConfig::default())
    }

    /// Create an empty server list with explicit tunables.
    pub fn with_config(
        transport: Arc<dyn MembershipTransport>,
        log: Arc<dyn CoordinationLog>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(CoordinatorServerList {
            inner: Mutex::new(Inner::new()),
            has_updates_or_stop: Condvar::new(),
            list_up_to_date: Condvar::new(),
            transport,
            log,
            config,
            updater_thread: Mutex::new(None),
        })
    }

    /// Enlist a server into the cluster and return its new id.
    ///
    /// `replaces_id` names the enlisting server's previous incarnation
    /// when it is rejoining after a reboot; [`ServerId::INVALID`] means
    /// none. A previous incarnation that is still UP at the same locator
    /// is crashed in the same published diff, so every consumer observes
    /// its departure before the new id. A `replaces_id` naming a live UP
    /// server at a *different* locator is a split-brain signal and the
    /// enlistment is refused.
    ///
    /// The returned id is durable: the enlistment record is appended to
    /// the durable log before the id becomes visible anywhere.
    pub fn enlist_server(
        &self,
        replaces_id: ServerId,
        services: ServiceMask,
        read_speed: u32,
        service_locator: &str,
    ) -> Result<ServerId, CoordinatorError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entry(replaces_id) {
            if existing.status == ServerStatus::Up && existing.service_locator != service_locator {
                return EnlistmentConflictSnafu {
                    replaces: replaces_id,
                    locator: service_locator.to_string(),
                    existing_locator: existing.service_locator.clone(),
                }
                .fail();
            }
        }

        ops::ServerUpUpdate {
            log: &*self.log,
            inner: &mut inner,
        }
        .execute()?;

        let update_version = inner.version + 1;
        let replaced_up = inner
            .entry(replaces_id)
            .map(|e| e.status == ServerStatus::Up)
            .unwrap_or(false);
        if replaced_up {
            warn!(
                replaces = %replaces_id,
                locator = service_locator,
                "enlistment replaces a live server; crashing the old incarnation"
            );
            self.crash_server_locked(&mut inner, replaces_id, update_version)?;
        }

        let new_server_id = inner.reserve_id(self.config.max_server_slots)?;
        ops::EnlistServer {
            log: &*self.log,
            inner: &mut inner,
            new_server_id,
            services,
            read_speed,
            service_locator,
            update_version,
        }
        .execute()?;

        if services.has(ServiceKind::Backup) {
            self.create_replication_groups(&mut inner, update_version)?;
        }

        let published = self.push_update(&mut inner);
        ops::PersistServerListVersion {
            log: &*self.log,
            inner: &mut inner,
            version: published,
        }
        .execute()?;
        self.clear_markers(&mut inner)?;

        info!(
            server_id = %new_server_id,
            services = %services,
            locator = service_locator,
            version = published,
            "server enlisted"
        );
        Ok(new_server_id)
    }

    /// Declare an UP server crashed.
    ///
    /// Marks the server as needing recovery, dissolves its replication
    /// group, publishes the crash to the cluster, and notifies trackers
    /// (which is how the master recovery manager learns of the failure).
    pub fn server_crashed(&self, server_id: ServerId) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock();
        match inner.entry(server_id) {
            None => return NoSuchServerSnafu { server_id }.fail(),
            Some(e) if e.status != ServerStatus::Up => {
                return ServerNotUpSnafu { server_id }.fail()
            }
            Some(_) => {}
        }
        let update_version = inner.version + 1;
        self.crash_server_locked(&mut inner, server_id, update_version)?;
        let published = self.push_update(&mut inner);
        ops::PersistServerListVersion {
            log: &*self.log,
            inner: &mut inner,
            version: published,
        }
        .execute()?;
        self.clear_markers(&mut inner)?;
        warn!(server_id = %server_id, version = published, "server crashed");
        Ok(())
    }

    /// Complete a crashed server's recovery and publish its removal.
    ///
    /// The slot is reclaimed only after every live server has confirmed
    /// the REMOVE update.
    pub fn recovery_completed(&self, server_id: ServerId) -> Result<(), CoordinatorError> {
        let mut inner = self.inner.lock();
        match inner.entry(server_id) {
            None => return NoSuchServerSnafu { server_id }.fail(),
            Some(e) if e.status != ServerStatus::Crashed => {
                return ServerNotCrashedSnafu { server_id }.fail()
            }
            Some(_) => {}
        }
        let update_version = inner.version + 1;
        ops::ServerRemoveUpdate {
            log: &*self.log,
            inner: &mut inner,
            server_id,
            update_version,
        }
        .execute()?;
        let published = self.push_update(&mut inner);
        ops::PersistServerListVersion {
            log: &*self.log,
            inner: &mut inner,
            version: published,
        }
        .execute()?;
        info!(server_id = %server_id, version = published, "server recovery completed");
        Ok(())
    }

    /// Replace the opaque recovery information kept for `server_id`.
    ///
    /// Returns `Ok(false)` when the id no longer names a live entry. The
    /// information is coordinator-only and is not propagated to the
    /// cluster.
    pub fn set_master_recovery_info(
        &self,
        server_id: ServerId,
        info: Bytes,
    ) -> Result<bool, CoordinatorError> {
        let mut inner = self.inner.lock();
        if inner.entry(server_id).is_none() {
            return Ok(false);
        }
        ops::ServerUpdateOp {
            log: &*self.log,
            inner: &mut inner,
            server_id,
            master_recovery_info: info,
        }
        .execute()?;
        debug!(server_id = %server_id, "master recovery info updated");
        Ok(true)
    }

    /// A value copy of the entry named by `server_id`, rejecting stale
    /// generations.
    pub fn get(&self, server_id: ServerId) -> Option<Entry> {
        self.inner.lock().entry(server_id).cloned()
    }

    /// A value copy of the entry occupying `index`, if any.
    pub fn get_by_index(&self, index: u32) -> Option<Entry> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(index as usize)
            .and_then(|s| s.entry.clone())
    }

    /// Value copies of every occupied slot, in index order.
    pub fn entries(&self) -> Vec<Entry> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|s| s.entry.clone())
            .collect()
    }

    /// Number of slots in the table, occupied or not.
    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Serving masters.
    pub fn master_count(&self) -> u32 {
        self.inner.lock().num_masters
    }

    /// Serving backups.
    pub fn backup_count(&self) -> u32 {
        self.inner.lock().num_backups
    }

    /// Version of the most recently published update.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Snapshot of the list restricted to servers running at least one
    /// service in `filter`, stamped with the current version.
    pub fn serialize(&self, filter: ServiceMask) -> ServerListUpdate {
        self.inner.lock().serialize_filtered(filter)
    }

    /// Register an observer of add/crash/remove events.
    pub fn register_tracker(&self, tracker: Arc<dyn ServerTracker>) {
        self.inner.lock().trackers.push(tracker);
    }

    /// Crash `server_id` under the held lock: persist the crash and the
    /// needs-recovery marker, stage the CRASH row, and rebuild replication
    /// groups around the loss. The caller publishes.
    fn crash_server_locked(
        &self,
        inner: &mut Inner,
        server_id: ServerId,
        update_version: u64,
    ) -> Result<(), CoordinatorError> {
        ops::ServerCrashed {
            log: &*self.log,
            inner,
            server_id,
            update_version,
        }
        .execute()?;
        ops::ServerNeedsRecovery {
            log: &*self.log,
            inner,
            server_id,
        }
        .execute()?;
        let group = inner
            .entry(server_id)
            .map(|e| e.replication_id)
            .unwrap_or(UNASSIGNED_REPLICATION_ID);
        if group != UNASSIGNED_REPLICATION_ID {
            self.remove_replication_group(inner, group, update_version)?;
        }
        Ok(())
    }

    /// Form replication groups while at least `replication_group_size`
    /// unassigned UP backups exist. Each member's assignment is persisted
    /// and staged under `update_version`.
    fn create_replication_groups(
        &self,
        inner: &mut Inner,
        update_version: u64,
    ) -> Result<(), CoordinatorError> {
        loop {
            let unassigned: Vec<ServerId> = inner
                .slots
                .iter()
                .filter_map(|s| s.entry.as_ref())
                .filter(|e| e.is_backup() && e.replication_id == UNASSIGNED_REPLICATION_ID)
                .map(|e| e.server_id)
                .collect();
            if unassigned.len() < self.config.replication_group_size {
                return Ok(());
            }
            ops::ServerReplicationUpUpdate {
                log: &*self.log,
                inner,
            }
            .execute()?;
            let replication_id = inner.next_replication_id;
            inner.next_replication_id += 1;
            for server_id in unassigned
                .into_iter()
                .take(self.config.replication_group_size)
            {
                ops::ServerReplicationUpdateOp {
                    log: &*self.log,
                    inner,
                    server_id,
                    replication_id,
                    update_version,
                }
                .execute()?;
            }
            debug!(replication_id, "replication group formed");
        }
    }

    /// Dissolve replication group `group`: surviving members return to
    /// the unassigned pool (persisted and staged), after which formation
    /// is retried against the enlarged pool. The failed member keeps its
    /// stale group id; it is leaving the list and the pool only admits
    /// serving backups.
    fn remove_replication_group(
        &self,
        inner: &mut Inner,
        group: u64,
        update_version: u64,
    ) -> Result<(), CoordinatorError> {
        let survivors: Vec<ServerId> = inner
            .slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.replication_id == group && e.status == ServerStatus::Up)
            .map(|e| e.server_id)
            .collect();
        ops::ServerReplicationUpUpdate {
            log: &*self.log,
            inner,
        }
        .execute()?;
        for server_id in survivors {
            ops::ServerReplicationUpdateOp {
                log: &*self.log,
                inner,
                server_id,
                replication_id: UNASSIGNED_REPLICATION_ID,
                update_version,
            }
            .execute()?;
        }
        debug!(replication_id = group, "replication group dissolved");
        self.create_replication_groups(inner, update_version)
    }

    /// Publish the staged diff as the next list version.
    ///
    /// Appends the `(incremental, full)` pair at the tail of the update
    /// log and wakes the updater. A no-op returning the current version
    /// when nothing is staged.
    pub(crate) fn push_update(&self, inner: &mut Inner) -> u64 {
        if inner.pending.is_empty() {
            return inner.version;
        }
        inner.version += 1;
        let version = inner.version;
        let incremental = inner.pending.take_update(version);
        let full = inner.snapshot();
        debug!(
            version,
            rows = incremental.entries.len(),
            "server list update published"
        );
        inner.updates.append(incremental, full);
        self.has_updates_or_stop.notify_all();
        version
    }

    /// Invalidate the "update pending" markers once the enclosing
    /// operation has fully published and checkpointed.
    pub(crate) fn clear_markers(&self, inner: &mut Inner) -> Result<(), CoordinatorError> {
        if let Some(id) = inner.log_id_up_update_marker.take() {
            self.log.invalidate(&[id])?;
        }
        if let Some(id) = inner.log_id_replication_up_update_marker.take() {
            self.log.invalidate(&[id])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable_log::MemoryLog;
    use crate::transport::MockTransport;

    fn list() -> Arc<CoordinatorServerList> {
        CoordinatorServerList::new(Arc::new(MockTransport::new()), Arc::new(MemoryLog::new()))
    }

    fn master_mask() -> ServiceMask {
        ServiceMask::of(&[ServiceKind::Master, ServiceKind::Membership])
    }

    fn backup_mask() -> ServiceMask {
        ServiceMask::of(&[ServiceKind::Backup, ServiceKind::Membership])
    }

    #[test]
    fn test_enlist_assigns_rising_versions_and_counts() {
        let list = list();
        let m1 = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=m1")
            .unwrap();
        let m2 = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=m2")
            .unwrap();
        let b1 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b1")
            .unwrap();
        assert_eq!(list.version(), 3);
        assert_eq!(list.master_count(), 2);
        assert_eq!(list.backup_count(), 1);
        assert_eq!(m1, ServerId::new(0, 1));
        assert_eq!(m2, ServerId::new(1, 1));
        assert_eq!(b1, ServerId::new(2, 1));
    }

    #[test]
    fn test_stale_generation_lookup_is_absent() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        assert!(list.get(id).is_some());
        assert!(list.get(ServerId::new(id.index(), id.generation() + 1)).is_none());
        assert!(list.get(ServerId::new(id.index(), 0)).is_none());
    }

    #[test]
    fn test_crash_requires_up_server() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        list.server_crashed(id).unwrap();
        assert!(matches!(
            list.server_crashed(id),
            Err(CoordinatorError::ServerNotUp { .. })
        ));
        assert!(matches!(
            list.server_crashed(ServerId::new(9, 9)),
            Err(CoordinatorError::NoSuchServer { .. })
        ));
    }

    #[test]
    fn test_recovery_completed_requires_crashed_server() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        assert!(matches!(
            list.recovery_completed(id),
            Err(CoordinatorError::ServerNotCrashed { .. })
        ));
        list.server_crashed(id).unwrap();
        list.recovery_completed(id).unwrap();
    }

    #[test]
    fn test_crash_clears_counts_and_sets_needs_recovery() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        list.server_crashed(id).unwrap();
        let entry = list.get(id).unwrap();
        assert_eq!(entry.status, ServerStatus::Crashed);
        assert!(entry.needs_recovery);
        assert_eq!(list.master_count(), 0);
    }

    #[test]
    fn test_split_brain_enlistment_is_refused() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        let before = list.version();
        let err = list
            .enlist_server(id, master_mask(), 0, "tcp:host=imposter")
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::EnlistmentConflict { .. }));
        assert_eq!(list.version(), before);
        assert_eq!(list.get(id).unwrap().status, ServerStatus::Up);
    }

    #[test]
    fn test_serialize_filters_by_service() {
        let list = list();
        list.enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=m")
            .unwrap();
        list.enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b")
            .unwrap();
        let masters = list.serialize(ServiceMask::of(&[ServiceKind::Master]));
        assert_eq!(masters.entries.len(), 1);
        assert_eq!(masters.version_number, 2);
        let backups = list.serialize(ServiceMask::of(&[ServiceKind::Backup]));
        assert_eq!(backups.entries.len(), 1);
        assert_eq!(backups.entries[0].service_locator, "tcp:host=b");
    }

    #[test]
    fn test_replication_group_forms_at_three_backups() {
        let list = list();
        let b1 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b1")
            .unwrap();
        let b2 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b2")
            .unwrap();
        assert_eq!(list.get(b1).unwrap().replication_id, 0);
        assert_eq!(list.get(b2).unwrap().replication_id, 0);
        let b3 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b3")
            .unwrap();
        for id in [b1, b2, b3] {
            assert_eq!(list.get(id).unwrap().replication_id, 1);
        }
    }

    #[test]
    fn test_backup_crash_dissolves_group_and_reforms_later() {
        let list = list();
        let ids: Vec<ServerId> = (0..3)
            .map(|i| {
                list.enlist_server(
                    ServerId::INVALID,
                    backup_mask(),
                    100,
                    &format!("tcp:host=b{i}"),
                )
                .unwrap()
            })
            .collect();
        list.server_crashed(ids[1]).unwrap();
        assert_eq!(list.get(ids[0]).unwrap().replication_id, 0);
        assert_eq!(list.get(ids[2]).unwrap().replication_id, 0);

        let b4 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b4")
            .unwrap();
        let b5 = list
            .enlist_server(ServerId::INVALID, backup_mask(), 100, "tcp:host=b5")
            .unwrap();
        // The pool reached three at b4's enlistment, so the survivors and
        // b4 formed group 2 with a fresh, never-reused id; b5 waits.
        assert_eq!(list.get(b4).unwrap().replication_id, 2);
        assert_eq!(list.get(b5).unwrap().replication_id, 0);
        let assigned = list
            .entries()
            .iter()
            .filter(|e| e.replication_id == 2)
            .count();
        assert_eq!(assigned, 3);
    }

    #[test]
    fn test_set_master_recovery_info_rejects_stale_id() {
        let list = list();
        let id = list
            .enlist_server(ServerId::INVALID, master_mask(), 0, "tcp:host=a")
            .unwrap();
        assert!(list
            .set_master_recovery_info(id, Bytes::from_static(b"epoch=7"))
            .unwrap());
        assert_eq!(
            list.get(id).unwrap().master_recovery_info,
            Bytes::from_static(b"epoch=7")
        );
        let stale = ServerId::new(id.index(), id.generation() + 1);
        assert!(!list
            .set_master_recovery_info(stale, Bytes::from_static(b"x"))
            .unwrap());
    }
}
