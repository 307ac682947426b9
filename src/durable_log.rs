//! Durable log adapter backing coordinator crash recovery.
//!
//! The coordinator persists its intent to an external append-only,
//! invalidatable log before performing any visible membership change.
//! Each record is identified by an [`EntryId`]; superseded records are
//! invalidated so that a replay surfaces only the live set, in append
//! order. The log itself (a replicated state-machine service in
//! production) is out of scope; this module defines the contract the
//! coordinator consumes plus an in-memory implementation used by tests
//! and standalone deployments.
//!
//! ## Record protocol
//!
//! Every state-changing operation follows the same shape:
//!
//! 1. build the record describing the intent, including the list version
//!    the change will publish under;
//! 2. append it (atomically invalidating the record it supersedes);
//! 3. stamp the returned id into the owning entry or coordinator state;
//! 4. perform the in-memory mutation and publish the update.
//!
//! A crash between steps 2 and 4 is resumed forward at recovery: replay
//! re-invokes the in-memory half of the operation from the surviving
//! record.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::id::ServerId;
use crate::id::ServiceMask;

/// Identifier of one record in the durable log.
pub type EntryId = u64;

/// Errors from the durable log.
#[derive(Debug, Snafu)]
pub enum LogError {
    /// An append was refused or lost.
    #[snafu(display("append failed: {message}"))]
    Append {
        /// Description from the log service.
        message: String,
    },

    /// An invalidation was refused or lost.
    #[snafu(display("invalidate failed: {message}"))]
    Invalidate {
        /// Description from the log service.
        message: String,
    },

    /// Replay could not enumerate or decode the live records.
    #[snafu(display("replay failed: {message}"))]
    Replay {
        /// Description from the log service.
        message: String,
    },
}

/// Enlistment facts for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInformation {
    /// The enlisted server's id.
    pub server_id: ServerId,
    /// Services the server runs.
    pub services: ServiceMask,
    /// Backup read speed in MB/s.
    pub read_speed: u32,
    /// Transport address of the server.
    pub service_locator: String,
    /// List version under which the server's ADD was published, when known.
    pub update_version: Option<u64>,
}

/// Crash-related facts for one server. The record kind carrying this body
/// distinguishes crashed, needs-recovery, and remove-update markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCrashInfo {
    /// The affected server's id.
    pub server_id: ServerId,
    /// List version under which the change was published, when relevant.
    pub update_version: Option<u64>,
}

/// Checkpoint of the current list version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListVersion {
    /// The version the coordinator had published when the checkpoint was
    /// appended.
    pub version: u64,
}

/// Coordinator-only attribute update for one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerUpdate {
    /// The affected server's id.
    pub server_id: ServerId,
    /// Opaque recovery information kept on the server's behalf.
    pub master_recovery_info: Bytes,
}

/// Replication group assignment for one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReplicationUpdate {
    /// The affected backup's id.
    pub server_id: ServerId,
    /// The assigned replication group; 0 means unassigned.
    pub replication_id: u64,
    /// List version under which the assignment was published.
    pub update_version: u64,
}

/// A tagged record in the durable log.
///
/// The variants match the recovery callbacks on the server list: each kind
/// replays through exactly one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// A server enlisted.
    ServerInformation(ServerInformation),
    /// A server's coordinator-only attributes changed.
    ServerUpdate(ServerUpdate),
    /// A server was declared crashed.
    ServerCrashed(ServerCrashInfo),
    /// A crashed server still needs recovery.
    ServerNeedsRecovery(ServerCrashInfo),
    /// A recovered server's REMOVE update must reach the cluster.
    ServerRemoveUpdate(ServerCrashInfo),
    /// Checkpoint of the published list version.
    ServerListVersion(ServerListVersion),
    /// A backup's replication group changed.
    ServerReplicationUpdate(ServerReplicationUpdate),
    /// Marker: an enlistment's UP update may not have been published yet.
    ServerUpUpdate,
    /// Marker: a replication assignment may not have been published yet.
    ServerReplicationUpUpdate,
}

/// Contract the coordinator consumes from the durable log service.
///
/// Appends and invalidations are atomic; replay surfaces the live records
/// in append order.
pub trait CoordinationLog: Send + Sync {
    /// Append one record, atomically invalidating `invalidates`, and
    /// return the new record's id.
    fn append(&self, record: &LogRecord, invalidates: &[EntryId]) -> Result<EntryId, LogError>;

    /// Invalidate a set of records, returning the tombstone's id when the
    /// set was non-empty.
    fn invalidate(&self, ids: &[EntryId]) -> Result<Option<EntryId>, LogError>;

    /// Enumerate the live records in append order.
    fn replay(&self) -> Result<Vec<(EntryId, LogRecord)>, LogError>;
}

/// In-memory [`CoordinationLog`] used by tests and standalone deployments.
///
/// Records are stored postcard-encoded so replay exercises the same codec
/// a remote log service would.
#[derive(Default)]
pub struct MemoryLog {
    state: Mutex<MemoryLogState>,
}

struct MemoryLogState {
    next_id: EntryId,
    records: BTreeMap<EntryId, Vec<u8>>,
}

impl Default for MemoryLogState {
    fn default() -> Self {
        MemoryLogState {
            next_id: 1,
            records: BTreeMap::new(),
        }
    }
}

impl MemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        MemoryLog::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether the log holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CoordinationLog for MemoryLog {
    fn append(&self, record: &LogRecord, invalidates: &[EntryId]) -> Result<EntryId, LogError> {
        let bytes = postcard::to_allocvec(record).map_err(|e| LogError::Append {
            message: e.to_string(),
        })?;
        let mut state = self.state.lock();
        for id in invalidates {
            state.records.remove(id);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(id, bytes);
        Ok(id)
    }

    fn invalidate(&self, ids: &[EntryId]) -> Result<Option<EntryId>, LogError> {
        if ids.is_empty() {
            return Ok(None);
        }
        let mut state = self.state.lock();
        for id in ids {
            state.records.remove(id);
        }
        let tombstone = state.next_id;
        state.next_id += 1;
        Ok(Some(tombstone))
    }

    fn replay(&self) -> Result<Vec<(EntryId, LogRecord)>, LogError> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .map(|(id, bytes)| {
                let record = postcard::from_bytes(bytes).map_err(|e| LogError::Replay {
                    message: e.to_string(),
                })?;
                Ok((*id, record))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash_record(index: u32) -> LogRecord {
        LogRecord::ServerCrashed(ServerCrashInfo {
            server_id: ServerId::new(index, 1),
            update_version: Some(2),
        })
    }

    #[test]
    fn test_append_assigns_rising_ids() {
        let log = MemoryLog::new();
        let a = log.append(&crash_record(0), &[]).unwrap();
        let b = log.append(&crash_record(1), &[]).unwrap();
        assert!(b > a);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_append_invalidates_atomically() {
        let log = MemoryLog::new();
        let a = log.append(&crash_record(0), &[]).unwrap();
        let b = log.append(&crash_record(1), &[a]).unwrap();
        let live = log.replay().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, b);
    }

    #[test]
    fn test_replay_preserves_append_order() {
        let log = MemoryLog::new();
        let records: Vec<LogRecord> = (0..5).map(crash_record).collect();
        for record in &records {
            log.append(record, &[]).unwrap();
        }
        let replayed: Vec<LogRecord> = log.replay().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(replayed, records);
    }

    #[test]
    fn test_invalidate_returns_tombstone_only_when_nonempty() {
        let log = MemoryLog::new();
        let a = log.append(&crash_record(0), &[]).unwrap();
        assert!(log.invalidate(&[]).unwrap().is_none());
        assert!(log.invalidate(&[a]).unwrap().is_some());
        assert!(log.is_empty());
    }

    #[test]
    fn test_record_kinds_roundtrip() {
        let log = MemoryLog::new();
        log.append(&LogRecord::ServerUpUpdate, &[]).unwrap();
        log.append(
            &LogRecord::ServerListVersion(ServerListVersion { version: 12 }),
            &[],
        )
        .unwrap();
        let replayed = log.replay().unwrap();
        assert_eq!(replayed[0].1, LogRecord::ServerUpUpdate);
        assert_eq!(
            replayed[1].1,
            LogRecord::ServerListVersion(ServerListVersion { version: 12 })
        );
    }
}
