//! In-process observers of membership changes.
//!
//! Components such as the master recovery manager register a tracker and
//! receive one event per add, crash, or remove as the change is staged.
//! Callbacks run under the coordinator lock: they must return quickly and
//! must not call back into the server list.

use crate::id::ServerId;
use crate::id::ServiceMask;

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerChange {
    /// A server joined the list.
    Add,
    /// A server was declared crashed.
    Crash,
    /// A recovered server is leaving the list.
    Remove,
}

/// One membership change delivered to trackers.
#[derive(Debug, Clone)]
pub struct ServerChangeEvent {
    /// The affected server.
    pub server_id: ServerId,
    /// The server's transport address.
    pub service_locator: String,
    /// Services the server runs.
    pub services: ServiceMask,
    /// What happened.
    pub change: ServerChange,
}

/// Observer of membership changes.
pub trait ServerTracker: Send + Sync {
    /// Called once per staged add, crash, or remove. During coordinator
    /// recovery, trackers receive the reconstructed membership as a fresh
    /// sequence of events.
    fn on_server_change(&self, event: &ServerChangeEvent);
}
