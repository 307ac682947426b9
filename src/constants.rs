//! Centralized constants for the coordinator server list.
//!
//! Each constant has an explicit bound to keep resource usage predictable;
//! the values marked configurable can be overridden through
//! [`CoordinatorConfig`](crate::server_list::CoordinatorConfig).

/// Maximum number of incremental server list updates batched into one
/// update RPC. Configurable.
///
/// Bounds the work assigned per dispatch so a badly lagging server cannot
/// monopolize the updater with one enormous RPC.
///
/// Used in:
/// - `server_list/updater.rs`: work-unit tail computation
pub const MAX_UPDATES_PER_RPC: u64 = 100;

/// Maximum serialized size of an outgoing update RPC payload (10 MB).
/// Configurable.
///
/// Matches the transport's message cap. The updater stops appending
/// incremental updates once the next one would push the payload past this
/// limit; the delivered version becomes the last one that fit. The first
/// component of a batch is always sent so a lagging server makes progress
/// even when a single update exceeds the cap.
///
/// Used in:
/// - `server_list/updater.rs`: batch construction
pub const MAX_RPC_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Number of backups collected into one replication group. Configurable.
///
/// Used in:
/// - `server_list/mod.rs`: replication group formation
pub const REPLICATION_GROUP_SIZE: usize = 3;

/// Server list version of a server that has never received an update.
///
/// A server whose verified version equals this value is sent the full
/// list rather than a chain of incrementals.
pub const UNINITIALIZED_VERSION: u64 = 0;

/// Maximum number of slots in the server table (65,536).
///
/// Fixed limit prevents unbounded growth of the slot table; enlistment
/// fails once every slot below this bound is occupied.
///
/// Used in:
/// - `server_list/mod.rs`: slot allocation
pub const MAX_SERVER_SLOTS: u32 = 65_536;

/// Replication group id of a backup that belongs to no group.
pub const UNASSIGNED_REPLICATION_ID: u64 = 0;
