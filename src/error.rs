//! Error types for coordinator server list operations.

use snafu::Snafu;

use crate::durable_log::LogError;
use crate::id::ServerId;

/// Errors surfaced by mutating operations on the coordinator server list.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinatorError {
    /// The id names no live server (never enlisted, stale generation, or
    /// already removed and reclaimed).
    #[snafu(display("server {server_id} is not in the server list"))]
    NoSuchServer {
        /// The id that failed to resolve.
        server_id: ServerId,
    },

    /// The operation requires an UP server.
    #[snafu(display("server {server_id} is not up"))]
    ServerNotUp {
        /// The id of the offending server.
        server_id: ServerId,
    },

    /// The operation requires a CRASHED server.
    #[snafu(display("server {server_id} has not crashed"))]
    ServerNotCrashed {
        /// The id of the offending server.
        server_id: ServerId,
    },

    /// An enlistment named a live UP server with a different locator as the
    /// server it replaces. Two servers claiming each other's identity is a
    /// split-brain signal; the enlistment is refused with no state change.
    #[snafu(display(
        "enlistment at {locator} claims to replace live server {replaces} at {existing_locator}"
    ))]
    EnlistmentConflict {
        /// The id the enlisting server claimed to replace.
        replaces: ServerId,
        /// Locator of the enlisting server.
        locator: String,
        /// Locator of the live server that would have been replaced.
        existing_locator: String,
    },

    /// Every slot below the table bound is occupied.
    #[snafu(display("server slot table is full ({limit} slots)"))]
    SlotTableFull {
        /// The configured slot bound.
        limit: u32,
    },

    /// The durable log refused an append or invalidation. The in-memory
    /// state was not touched; the coordinator must treat this as fatal and
    /// restart through recovery.
    #[snafu(display("durable log operation failed: {source}"))]
    #[snafu(context(false))]
    Log {
        /// The underlying log error.
        source: LogError,
    },
}
