//! Per-server state kept by the coordinator.

use bytes::Bytes;

use crate::durable_log::EntryId;
use crate::id::ServerId;
use crate::id::ServiceKind;
use crate::id::ServiceMask;
use crate::proto::ServerListEntry;
use crate::proto::ServerStatus;

/// One server's coordinator-side record.
///
/// `verified_version` and `update_version` implement a two-phase commit
/// over update RPCs: `update_version` is the promise (the version handed
/// to an in-flight or completed RPC), `verified_version` the commit (the
/// version the server acknowledged). They are equal exactly when no RPC
/// is assigned to the server. Starting an RPC sets the promise; success
/// commits it; failure rolls it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The server's id.
    pub server_id: ServerId,
    /// Transport address of the server.
    pub service_locator: String,
    /// Services the server runs.
    pub services: ServiceMask,
    /// Backup read speed in MB/s.
    pub read_speed: u32,
    /// Lifecycle status.
    pub status: ServerStatus,
    /// Replication group of a backup; 0 means unassigned. For a removed
    /// entry this field is repurposed: see `update_version`.
    pub replication_id: u64,
    /// Opaque bytes kept on behalf of master recovery.
    pub master_recovery_info: Bytes,
    /// Whether the server's crash recovery has yet to complete.
    pub needs_recovery: bool,
    /// Latest list version the server acknowledged.
    pub verified_version: u64,
    /// Latest list version handed to an update RPC for this server. For a
    /// removed entry it instead holds the version of the REMOVE update and
    /// is no longer rolled back; removed entries are never assigned work.
    pub update_version: u64,

    // Durable log records carrying the last persisted facts about this
    // entry. Invalidated together when the slot is reclaimed.
    pub(crate) log_id_server_up: Option<EntryId>,
    pub(crate) log_id_server_crashed: Option<EntryId>,
    pub(crate) log_id_server_needs_recovery: Option<EntryId>,
    pub(crate) log_id_server_remove_update: Option<EntryId>,
    pub(crate) log_id_server_update: Option<EntryId>,
    pub(crate) log_id_server_replication_update: Option<EntryId>,
}

impl Entry {
    /// Create a fresh UP entry that has never been sent an update.
    pub(crate) fn new(
        server_id: ServerId,
        service_locator: String,
        services: ServiceMask,
        read_speed: u32,
    ) -> Self {
        Entry {
            server_id,
            service_locator,
            services,
            read_speed,
            status: ServerStatus::Up,
            replication_id: 0,
            master_recovery_info: Bytes::new(),
            needs_recovery: false,
            verified_version: 0,
            update_version: 0,
            log_id_server_up: None,
            log_id_server_crashed: None,
            log_id_server_needs_recovery: None,
            log_id_server_remove_update: None,
            log_id_server_update: None,
            log_id_server_replication_update: None,
        }
    }

    /// Whether the entry is a serving master.
    pub fn is_master(&self) -> bool {
        self.status == ServerStatus::Up && self.services.has(ServiceKind::Master)
    }

    /// Whether the entry is a serving backup.
    pub fn is_backup(&self) -> bool {
        self.status == ServerStatus::Up && self.services.has(ServiceKind::Backup)
    }

    /// Whether the coordinator sends this entry server list updates.
    pub fn accepts_updates(&self) -> bool {
        self.status == ServerStatus::Up && self.services.has(ServiceKind::Membership)
    }

    /// The entry's row in a server list update, at its current status.
    pub(crate) fn to_wire(&self) -> ServerListEntry {
        ServerListEntry {
            services: self.services,
            server_id: self.server_id,
            service_locator: self.service_locator.clone(),
            status: self.status,
            replication_id: self.replication_id,
            read_speed: self.read_speed,
        }
    }

    /// Live durable log records tied to this entry, for invalidation when
    /// the slot is reclaimed.
    pub(crate) fn live_log_ids(&self) -> Vec<EntryId> {
        [
            self.log_id_server_up,
            self.log_id_server_crashed,
            self.log_id_server_needs_recovery,
            self.log_id_server_remove_update,
            self.log_id_server_update,
            self.log_id_server_replication_update,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// One slot in the server table: the next generation to issue plus the
/// entry currently occupying the slot, if any.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    /// Next generation number to issue for this index.
    pub next_generation: u32,
    /// The occupying entry.
    pub entry: Option<Entry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_is_up_and_unversioned() {
        let entry = Entry::new(
            ServerId::new(0, 1),
            "tcp:host=a,port=1".into(),
            ServiceMask::of(&[ServiceKind::Master, ServiceKind::Membership]),
            0,
        );
        assert_eq!(entry.status, ServerStatus::Up);
        assert_eq!(entry.verified_version, 0);
        assert_eq!(entry.update_version, 0);
        assert!(entry.is_master());
        assert!(!entry.is_backup());
        assert!(entry.accepts_updates());
        assert!(entry.live_log_ids().is_empty());
    }

    #[test]
    fn test_crashed_entry_is_not_master() {
        let mut entry = Entry::new(
            ServerId::new(0, 1),
            "tcp:host=a,port=1".into(),
            ServiceMask::of(&[ServiceKind::Master]),
            0,
        );
        entry.status = ServerStatus::Crashed;
        assert!(!entry.is_master());
        assert!(!entry.accepts_updates());
    }

    #[test]
    fn test_live_log_ids_collects_stamped_records() {
        let mut entry = Entry::new(
            ServerId::new(1, 1),
            "tcp:host=b,port=1".into(),
            ServiceMask::of(&[ServiceKind::Backup]),
            100,
        );
        entry.log_id_server_up = Some(4);
        entry.log_id_server_replication_update = Some(9);
        let mut ids = entry.live_log_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![4, 9]);
    }
}
