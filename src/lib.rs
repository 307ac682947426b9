//! Cluster-membership coordination for the Alder distributed storage
//! system.
//!
//! The centerpiece is [`CoordinatorServerList`]: the authoritative
//! registry of every server in the cluster, the asynchronous engine that
//! propagates membership changes to each live server, and the log-backed
//! recovery protocol that lets a crashed coordinator restore its state
//! exactly. The RPC substrate and the durable log service are consumed
//! through the [`transport::MembershipTransport`] and
//! [`durable_log::CoordinationLog`] traits; everything else lives here.

#![warn(missing_docs)]

/// Fixed limits and tunable defaults.
pub mod constants;
/// Durable log contract, record kinds, and the in-memory log.
pub mod durable_log;
/// Typed errors for coordinator operations.
pub mod error;
/// Server identifiers and service masks.
pub mod id;
/// Wire representations of the server list.
pub mod proto;
/// The coordinator server list and its updater engine.
pub mod server_list;
/// Observer interface for membership changes.
pub mod tracker;
/// Outbound update transport and the scriptable test double.
pub mod transport;

pub use durable_log::CoordinationLog;
pub use durable_log::MemoryLog;
pub use error::CoordinatorError;
pub use id::ServerId;
pub use id::ServiceKind;
pub use id::ServiceMask;
pub use proto::ServerListUpdate;
pub use proto::ServerStatus;
pub use proto::UpdateKind;
pub use server_list::CoordinatorConfig;
pub use server_list::CoordinatorServerList;
pub use server_list::Entry;
pub use tracker::ServerChange;
pub use tracker::ServerChangeEvent;
pub use tracker::ServerTracker;
pub use transport::MembershipTransport;
pub use transport::MockTransport;
pub use transport::UpdateOutcome;
