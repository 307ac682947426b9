//! Shared fixtures for the integration suites.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use alder_coordinator::CoordinatorConfig;
use alder_coordinator::CoordinatorServerList;
use alder_coordinator::MemoryLog;
use alder_coordinator::MockTransport;
use alder_coordinator::ServerId;
use alder_coordinator::ServiceKind;
use alder_coordinator::ServiceMask;

static TRACING: Once = Once::new();

/// Install a tracing subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A fresh list wired to a scriptable transport and an in-memory log.
pub fn fresh_list() -> (
    Arc<CoordinatorServerList>,
    Arc<MockTransport>,
    Arc<MemoryLog>,
) {
    init_tracing();
    let transport = Arc::new(MockTransport::new());
    let log = Arc::new(MemoryLog::new());
    let list = CoordinatorServerList::new(transport.clone(), log.clone());
    (list, transport, log)
}

/// Like [`fresh_list`] with explicit tunables.
pub fn fresh_list_with_config(
    config: CoordinatorConfig,
) -> (
    Arc<CoordinatorServerList>,
    Arc<MockTransport>,
    Arc<MemoryLog>,
) {
    init_tracing();
    let transport = Arc::new(MockTransport::new());
    let log = Arc::new(MemoryLog::new());
    let list = CoordinatorServerList::with_config(transport.clone(), log.clone(), config);
    (list, transport, log)
}

/// A master that accepts membership updates.
pub fn master_mask() -> ServiceMask {
    ServiceMask::of(&[ServiceKind::Master, ServiceKind::Membership])
}

/// A backup that accepts membership updates.
pub fn backup_mask() -> ServiceMask {
    ServiceMask::of(&[ServiceKind::Backup, ServiceKind::Membership])
}

/// A master that never receives updates (no membership service).
pub fn silent_mask() -> ServiceMask {
    ServiceMask::of(&[ServiceKind::Master])
}

/// Enlist a fresh server with no predecessor.
pub fn enlist(
    list: &Arc<CoordinatorServerList>,
    services: ServiceMask,
    locator: &str,
) -> ServerId {
    list.enlist_server(ServerId::INVALID, services, 100, locator)
        .expect("enlistment failed")
}
