//! Wire representations of the server list.
//!
//! A [`ServerListUpdate`] is what the coordinator ships to cluster members:
//! either the incremental diff that created one version or a full snapshot
//! of the list at one version. Consumers apply updates strictly in version
//! order; within a single incremental, removals and crashes precede
//! additions so a re-enlisting server is always observed as "old id gone,
//! new id present".

use serde::Deserialize;
use serde::Serialize;

use crate::id::ServerId;
use crate::id::ServiceMask;

/// Lifecycle status of a server as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// The server is part of the cluster and serving.
    Up,
    /// The server has failed; its recovery has not yet completed.
    Crashed,
    /// The server's recovery completed and it is leaving the list.
    Removed,
}

/// One server's row in a server list update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListEntry {
    /// Services the server runs.
    pub services: ServiceMask,
    /// The server's id.
    pub server_id: ServerId,
    /// Transport address of the server.
    pub service_locator: String,
    /// Status conveyed by this row.
    pub status: ServerStatus,
    /// Replication group the server belongs to; 0 means unassigned.
    pub replication_id: u64,
    /// Backup read speed in MB/s.
    pub read_speed: u32,
}

/// Whether an update is a diff or a complete snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateKind {
    /// The rows that created `version_number`, applied over the previous
    /// version.
    #[default]
    Incremental,
    /// Every live row at `version_number`, replacing the receiver's list.
    Full,
}

/// An ordered batch of server list rows stamped with a version.
///
/// Used both for incremental diffs (the rows that created `version_number`)
/// and for full snapshots (every live row at `version_number`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerListUpdate {
    /// Diff or snapshot.
    pub kind: UpdateKind,
    /// The list version this update produces when applied.
    pub version_number: u64,
    /// Rows in application order: removals and crashes first, then adds.
    pub entries: Vec<ServerListEntry>,
}

impl ServerListUpdate {
    /// Serialized payload size of this update, used to bound outgoing RPCs.
    pub fn encoded_len(&self) -> usize {
        postcard::to_allocvec(self).map(|b| b.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ServiceKind;

    fn entry(id: ServerId, status: ServerStatus) -> ServerListEntry {
        ServerListEntry {
            services: ServiceMask::of(&[ServiceKind::Master]),
            server_id: id,
            service_locator: "tcp:host=a,port=1".to_string(),
            status,
            replication_id: 0,
            read_speed: 0,
        }
    }

    #[test]
    fn test_update_roundtrips_through_postcard() {
        let update = ServerListUpdate {
            kind: UpdateKind::Incremental,
            version_number: 9,
            entries: vec![
                entry(ServerId::new(0, 1), ServerStatus::Crashed),
                entry(ServerId::new(0, 2), ServerStatus::Up),
            ],
        };
        let bytes = postcard::to_allocvec(&update).unwrap();
        assert_eq!(bytes.len(), update.encoded_len());
        let decoded: ServerListUpdate = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_encoded_len_grows_with_entries() {
        let mut update = ServerListUpdate {
            version_number: 1,
            ..Default::default()
        };
        let empty = update.encoded_len();
        update.entries.push(entry(ServerId::new(3, 1), ServerStatus::Up));
        assert!(update.encoded_len() > empty);
    }
}
