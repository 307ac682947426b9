//! Persist-then-mutate operation descriptors.
//!
//! Each membership operation is a short-lived descriptor borrowing the
//! server list's locked state. `execute()` appends the operation's durable
//! record and then runs `complete(entry_id)`, which stamps the record id
//! and performs the in-memory half. The split mirrors crash recovery:
//! replay rebuilds state by re-running the in-memory half from surviving
//! records, so any crash between the append and the visible change is
//! resumed forward, never lost.

use bytes::Bytes;

use super::entry::Entry;
use super::Inner;
use crate::durable_log::CoordinationLog;
use crate::durable_log::EntryId;
use crate::durable_log::LogRecord;
use crate::durable_log::ServerCrashInfo;
use crate::durable_log::ServerInformation;
use crate::durable_log::ServerListVersion;
use crate::durable_log::ServerReplicationUpdate;
use crate::durable_log::ServerUpdate;
use crate::error::CoordinatorError;
use crate::id::ServerId;
use crate::id::ServiceMask;

/// Enlist a new server: persist its information, install its entry, and
/// stage its ADD row.
pub(crate) struct EnlistServer<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub new_server_id: ServerId,
    pub services: ServiceMask,
    pub read_speed: u32,
    pub service_locator: &'a str,
    /// List version the ADD will publish under.
    pub update_version: u64,
}

impl EnlistServer<'_> {
    pub fn execute(self) -> Result<ServerId, CoordinatorError> {
        let record = LogRecord::ServerInformation(ServerInformation {
            server_id: self.new_server_id,
            services: self.services,
            read_speed: self.read_speed,
            service_locator: self.service_locator.to_string(),
            update_version: Some(self.update_version),
        });
        let entry_id = self.log.append(&record, &[])?;
        Ok(self.complete(entry_id))
    }

    pub fn complete(self, entry_id: EntryId) -> ServerId {
        let mut entry = Entry::new(
            self.new_server_id,
            self.service_locator.to_string(),
            self.services,
            self.read_speed,
        );
        entry.log_id_server_up = Some(entry_id);
        self.inner.install(entry);
        self.inner.stage_add(self.new_server_id);
        self.new_server_id
    }
}

/// Declare a server crashed: persist the crash and stage its CRASH row.
pub(crate) struct ServerCrashed<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub server_id: ServerId,
    /// List version the CRASH will publish under.
    pub update_version: u64,
}

impl ServerCrashed<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let record = LogRecord::ServerCrashed(ServerCrashInfo {
            server_id: self.server_id,
            update_version: Some(self.update_version),
        });
        let entry_id = self.log.append(&record, &[])?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        if let Some(e) = self.inner.entry_mut(self.server_id) {
            e.log_id_server_crashed = Some(entry_id);
        }
        self.inner.set_status_crashed(self.server_id);
        self.inner.stage_crashed(self.server_id);
    }
}

/// Record that a crashed server's recovery has not completed. The record
/// stays live until `recovery_completed` invalidates it, so a coordinator
/// crash restarts the recovery.
pub(crate) struct ServerNeedsRecovery<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub server_id: ServerId,
}

impl ServerNeedsRecovery<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let record = LogRecord::ServerNeedsRecovery(ServerCrashInfo {
            server_id: self.server_id,
            update_version: None,
        });
        let entry_id = self.log.append(&record, &[])?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        if let Some(e) = self.inner.entry_mut(self.server_id) {
            e.log_id_server_needs_recovery = Some(entry_id);
            e.needs_recovery = true;
        }
    }
}

/// Move a recovered server to REMOVED: persist the remove-update marker
/// (retiring the needs-recovery record) and stage its REMOVE row.
pub(crate) struct ServerRemoveUpdate<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub server_id: ServerId,
    /// List version the REMOVE will publish under.
    pub update_version: u64,
}

impl ServerRemoveUpdate<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let invalidates: Vec<EntryId> = self
            .inner
            .entry(self.server_id)
            .and_then(|e| e.log_id_server_needs_recovery)
            .into_iter()
            .collect();
        let record = LogRecord::ServerRemoveUpdate(ServerCrashInfo {
            server_id: self.server_id,
            update_version: Some(self.update_version),
        });
        let entry_id = self.log.append(&record, &invalidates)?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        let update_version = self.update_version;
        if let Some(e) = self.inner.entry_mut(self.server_id) {
            e.log_id_server_remove_update = Some(entry_id);
            e.log_id_server_needs_recovery = None;
        }
        self.inner.set_removed(self.server_id, update_version);
        self.inner.stage_removed(self.server_id);
    }
}

/// Replace a server's coordinator-only recovery information, retiring the
/// previous record for the same fact.
pub(crate) struct ServerUpdateOp<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub server_id: ServerId,
    pub master_recovery_info: Bytes,
}

impl ServerUpdateOp<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let invalidates: Vec<EntryId> = self
            .inner
            .entry(self.server_id)
            .and_then(|e| e.log_id_server_update)
            .into_iter()
            .collect();
        let record = LogRecord::ServerUpdate(ServerUpdate {
            server_id: self.server_id,
            master_recovery_info: self.master_recovery_info.clone(),
        });
        let entry_id = self.log.append(&record, &invalidates)?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        if let Some(e) = self.inner.entry_mut(self.server_id) {
            e.log_id_server_update = Some(entry_id);
            e.master_recovery_info = self.master_recovery_info;
        }
    }
}

/// Assign a backup's replication group, retiring the previous assignment
/// record, and stage the attribute change for the cluster.
pub(crate) struct ServerReplicationUpdateOp<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub server_id: ServerId,
    pub replication_id: u64,
    /// List version the assignment will publish under.
    pub update_version: u64,
}

impl ServerReplicationUpdateOp<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let invalidates: Vec<EntryId> = self
            .inner
            .entry(self.server_id)
            .and_then(|e| e.log_id_server_replication_update)
            .into_iter()
            .collect();
        let record = LogRecord::ServerReplicationUpdate(ServerReplicationUpdate {
            server_id: self.server_id,
            replication_id: self.replication_id,
            update_version: self.update_version,
        });
        let entry_id = self.log.append(&record, &invalidates)?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        if let Some(e) = self.inner.entry_mut(self.server_id) {
            e.log_id_server_replication_update = Some(entry_id);
            e.replication_id = self.replication_id;
        }
        self.inner.stage_attribute_update(self.server_id);
    }
}

/// Checkpoint the published list version, retiring the previous
/// checkpoint.
pub(crate) struct PersistServerListVersion<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
    pub version: u64,
}

impl PersistServerListVersion<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        let invalidates: Vec<EntryId> = self.inner.log_id_list_version.into_iter().collect();
        let record = LogRecord::ServerListVersion(ServerListVersion {
            version: self.version,
        });
        let entry_id = self.log.append(&record, &invalidates)?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        self.inner.log_id_list_version = Some(entry_id);
    }
}

/// Marker: an enlistment's UP update may not have been published yet.
/// Appended before the enlistment record and invalidated once the
/// operation has published and checkpointed. Idempotent while live.
pub(crate) struct ServerUpUpdate<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
}

impl ServerUpUpdate<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        if self.inner.log_id_up_update_marker.is_some() {
            return Ok(());
        }
        let entry_id = self.log.append(&LogRecord::ServerUpUpdate, &[])?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        self.inner.log_id_up_update_marker = Some(entry_id);
    }
}

/// Marker: a replication assignment may not have been published yet.
/// Same protocol as [`ServerUpUpdate`].
pub(crate) struct ServerReplicationUpUpdate<'a> {
    pub log: &'a dyn CoordinationLog,
    pub inner: &'a mut Inner,
}

impl ServerReplicationUpUpdate<'_> {
    pub fn execute(self) -> Result<(), CoordinatorError> {
        if self.inner.log_id_replication_up_update_marker.is_some() {
            return Ok(());
        }
        let entry_id = self
            .log
            .append(&LogRecord::ServerReplicationUpUpdate, &[])?;
        self.complete(entry_id);
        Ok(())
    }

    pub fn complete(self, entry_id: EntryId) {
        self.inner.log_id_replication_up_update_marker = Some(entry_id);
    }
}
