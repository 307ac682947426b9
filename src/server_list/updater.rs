//! The background update propagation engine.
//!
//! A single dedicated thread owns every outgoing server list update RPC.
//! It repeatedly scans the slot table for servers whose acknowledged
//! version lags the current version, batches the missing updates into one
//! RPC (full snapshot first for servers that have never been updated),
//! releases the coordinator lock across the send, and reconciles the
//! outcome under the lock.
//!
//! ## Two-phase version contract
//!
//! `update_version` is the promise, `verified_version` the commit. An
//! entry with `verified_version < update_version` has an RPC in flight
//! and is never handed out again until the outcome is applied: success
//! commits both fields to the delivered version, failure rolls the
//! promise back. A false success would permanently desynchronize the
//! target; a false failure costs at most one redundant retry.

use std::sync::Arc;
use std::thread;

use parking_lot::MutexGuard;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::update_log::UpdatePair;
use super::CoordinatorServerList;
use super::Inner;
use crate::constants::UNINITIALIZED_VERSION;
use crate::id::ServerId;
use crate::proto::ServerListUpdate;
use crate::proto::ServerStatus;
use crate::transport::UpdateOutcome;

/// Resumable state of the circular scan for lagging servers.
#[derive(Debug)]
pub(crate) struct ScanMetadata {
    /// Where the next scan resumes (and where a full pass ends).
    pub search_index: usize,
    /// The list version for which a complete scan found no assignable
    /// work. Zero means work may exist for the current version. The epoch
    /// keeps the heuristic transient: it clears itself whenever the list
    /// version moves.
    pub no_work_found_for_epoch: u64,
    /// Minimum verified version seen among update-accepting servers since
    /// the last full pass; committed to `min_confirmed_version` at the
    /// pass boundary.
    pub min_version: u64,
    /// Completed passes since the updater started. Used to spot the first
    /// pass and for debugging.
    pub complete_scans: u64,
}

impl ScanMetadata {
    pub fn new() -> Self {
        ScanMetadata {
            search_index: 0,
            no_work_found_for_epoch: 0,
            min_version: u64::MAX,
            complete_scans: 0,
        }
    }

    /// Forget all scan state, as on updater (re)start.
    pub fn reset(&mut self) {
        *self = ScanMetadata::new();
    }
}

/// One batch of update work assigned to the updater.
///
/// While the unit is outstanding, the target is handed no further work
/// and every update pair in `[first_update, update_version_tail]` remains
/// reachable.
pub(crate) struct UpdaterWorkUnit {
    /// The server to update.
    pub target: ServerId,
    /// Whether to lead with the full snapshot.
    pub send_full_list: bool,
    /// First pair of the batch; later pairs are reached through forward
    /// links without the lock.
    pub first_update: Arc<UpdatePair>,
    /// Last version the batch may carry.
    pub update_version_tail: u64,
}

impl CoordinatorServerList {
    /// Start the updater thread. A no-op when it is already running.
    pub fn start_updater(self: &Arc<Self>) {
        let mut handle = self.updater_thread.lock();
        if handle.is_some() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.stop_updater = false;
            inner.last_scan.reset();
        }
        let list = Arc::clone(self);
        *handle = Some(
            thread::Builder::new()
                .name("server-list-updater".into())
                .spawn(move || list.update_loop())
                .expect("spawn server list updater thread"),
        );
        info!("server list updater started");
    }

    /// Stop the updater thread and join it. Blocks until the thread's
    /// current RPC resolves and it observes the stop flag. A no-op when
    /// the updater is not running.
    pub fn halt_updater(&self) {
        let mut handle = self.updater_thread.lock();
        let Some(worker) = handle.take() else {
            return;
        };
        {
            let mut inner = self.inner.lock();
            inner.stop_updater = true;
        }
        self.has_updates_or_stop.notify_all();
        if worker.join().is_err() {
            warn!("server list updater thread panicked");
        }
        info!("server list updater halted");
    }

    /// Block the caller until every update-accepting server has confirmed
    /// the current list version. Starts the updater if necessary.
    pub fn sync(self: &Arc<Self>) {
        self.start_updater();
        let mut inner = self.inner.lock();
        while !inner.is_cluster_up_to_date() {
            self.list_up_to_date.wait(&mut inner);
        }
    }

    fn update_loop(self: Arc<Self>) {
        let mut inner = self.inner.lock();
        loop {
            if inner.stop_updater {
                break;
            }
            match self.get_work(&mut inner) {
                Some(unit) => {
                    let target = unit.target;
                    let (outcome, delivered) =
                        MutexGuard::unlocked(&mut inner, || self.send_update(&unit));
                    self.apply_outcome(&mut inner, target, outcome, delivered);
                }
                None => self.wait_for_work(&mut inner),
            }
        }
    }

    /// Sleep until the list version moves past the no-work epoch or the
    /// updater is stopped.
    fn wait_for_work(&self, inner: &mut MutexGuard<'_, Inner>) {
        while !inner.stop_updater && inner.last_scan.no_work_found_for_epoch == inner.version {
            self.has_updates_or_stop.wait(inner);
        }
    }

    /// Find the next server needing an update, resuming the circular scan
    /// where the previous call left off.
    ///
    /// Selection requires an UP, update-accepting server with no RPC in
    /// flight (`verified_version == update_version`) lagging the current
    /// version. Along the way the scan accumulates the minimum verified
    /// version; at each full-pass boundary that minimum becomes
    /// `min_confirmed_version`, the update log is pruned to it, and any
    /// REMOVED entry whose removal the cluster has confirmed is reclaimed.
    fn get_work(&self, inner: &mut Inner) -> Option<UpdaterWorkUnit> {
        let len = inner.slots.len();
        if len == 0 || inner.last_scan.no_work_found_for_epoch == inner.version {
            return None;
        }
        let start = inner.last_scan.search_index % len;
        let mut i = start;
        loop {
            let candidate = inner.slots[i].entry.as_ref().map(|e| {
                (
                    e.accepts_updates(),
                    e.verified_version,
                    e.update_version,
                    e.server_id,
                )
            });
            if let Some((true, verified, update, server_id)) = candidate {
                inner.last_scan.min_version = inner.last_scan.min_version.min(verified);
                if verified == update && update < inner.version {
                    if let Some(unit) = self.make_work_unit(inner, server_id, verified) {
                        if let Some(e) = inner.entry_mut(server_id) {
                            e.update_version = unit.update_version_tail;
                        }
                        inner.num_updating_servers += 1;
                        inner.last_scan.search_index = (i + 1) % len;
                        debug!(
                            target = %server_id,
                            tail = unit.update_version_tail,
                            full = unit.send_full_list,
                            "update work assigned"
                        );
                        return Some(unit);
                    }
                }
            }

            i = (i + 1) % len;
            if i == 0 {
                inner.min_confirmed_version = inner.last_scan.min_version;
                inner.last_scan.min_version = u64::MAX;
                inner.last_scan.complete_scans += 1;
                let pruned = inner.updates.prune(inner.min_confirmed_version);
                if pruned > 0 {
                    debug!(
                        pruned,
                        min_confirmed = inner.min_confirmed_version,
                        "update log pruned"
                    );
                }
                self.reclaim_confirmed_removals(inner);
            }
            if i == start {
                break;
            }
        }
        inner.last_scan.no_work_found_for_epoch = inner.version;
        if inner.is_cluster_up_to_date() {
            self.list_up_to_date.notify_all();
        }
        None
    }

    /// Build the work unit for one lagging server.
    ///
    /// A server that has never been updated, or whose next incremental
    /// has been pruned, is sent the full snapshot at the oldest retained
    /// version followed by incrementals; otherwise the batch starts at
    /// its next missing incremental. The tail is capped by the per-RPC
    /// batch limit.
    fn make_work_unit(
        &self,
        inner: &Inner,
        target: ServerId,
        verified: u64,
    ) -> Option<UpdaterWorkUnit> {
        let head = inner.updates.head()?;
        let tail_cap = (verified + self.config.max_updates_per_rpc).min(inner.version);
        let (send_full_list, first_update, update_version_tail) =
            if verified != UNINITIALIZED_VERSION && verified + 1 >= head.version {
                match inner.updates.get(verified + 1) {
                    Some(pair) => (false, pair, tail_cap),
                    None => (true, head.clone(), tail_cap.max(head.version)),
                }
            } else {
                (true, head.clone(), tail_cap.max(head.version))
            };
        Some(UpdaterWorkUnit {
            target,
            send_full_list,
            first_update,
            update_version_tail,
        })
    }

    /// Send one batched update RPC without holding the coordinator lock.
    ///
    /// Returns the transport outcome and the delivered version: the last
    /// version that fit under the payload cap. The first component always
    /// ships so a lagging server makes progress even when one update
    /// exceeds the cap. Traversal follows the update log's forward links;
    /// a link that has gone dead (the target crashed mid-flight and the
    /// range was pruned) simply ends the batch early.
    fn send_update(&self, unit: &UpdaterWorkUnit) -> (UpdateOutcome, u64) {
        let first = &unit.first_update;
        let mut lists: Vec<ServerListUpdate> = Vec::new();
        let mut payload;
        if unit.send_full_list {
            payload = first.full_len;
            lists.push(first.full.clone());
        } else {
            payload = first.incremental_len;
            lists.push(first.incremental.clone());
        }
        let mut delivered = first.version;
        let mut cursor = first.next();
        while let Some(pair) = cursor {
            if pair.version > unit.update_version_tail {
                break;
            }
            if payload + pair.incremental_len > self.config.max_rpc_payload_bytes {
                break;
            }
            payload += pair.incremental_len;
            delivered = pair.version;
            lists.push(pair.incremental.clone());
            cursor = pair.next();
        }
        debug!(
            target = %unit.target,
            delivered,
            batched = lists.len(),
            payload,
            "sending server list update"
        );
        let outcome = self.transport.send_server_list_update(unit.target, &lists);
        (outcome, delivered)
    }

    /// Reconcile one RPC outcome under the coordinator lock.
    fn apply_outcome(
        &self,
        inner: &mut Inner,
        target: ServerId,
        outcome: UpdateOutcome,
        delivered: u64,
    ) {
        inner.num_updating_servers -= 1;
        let status = inner.entry(target).map(|e| e.status);
        match (outcome, status) {
            (UpdateOutcome::Acked { .. }, Some(ServerStatus::Up)) => {
                if let Some(e) = inner.entry_mut(target) {
                    e.verified_version = delivered;
                    e.update_version = delivered;
                }
                debug!(target = %target, delivered, "server list update acknowledged");
                if delivered == inner.version && inner.is_cluster_up_to_date() {
                    self.list_up_to_date.notify_all();
                }
            }
            (UpdateOutcome::Acked { .. }, _) => {
                // The target crashed or vanished while the RPC was in
                // flight; the acknowledgement no longer means anything.
                self.rollback(inner, target);
            }
            (UpdateOutcome::Failed, _) => {
                self.rollback(inner, target);
                warn!(target = %target, "server list update failed; rolled back");
            }
            (UpdateOutcome::TargetGone, Some(ServerStatus::Up)) => {
                // The transport no longer knows the target, so nothing
                // further can reach it; hold it at the current version
                // until the failure monitor declares it crashed.
                let version = inner.version;
                if let Some(e) = inner.entry_mut(target) {
                    e.verified_version = version;
                    e.update_version = version;
                }
                warn!(target = %target, "update target gone; holding at current version");
                if inner.is_cluster_up_to_date() {
                    self.list_up_to_date.notify_all();
                }
            }
            (UpdateOutcome::TargetGone, Some(ServerStatus::Removed)) => {
                if inner.is_cluster_up_to_date() {
                    let index = target.index() as usize;
                    self.reclaim_slot(inner, index);
                }
            }
            (UpdateOutcome::TargetGone, _) => {
                self.rollback(inner, target);
            }
        }
    }

    /// Roll an entry's promise back to its commit and force a rescan so
    /// the rolled-back work is rediscovered.
    fn rollback(&self, inner: &mut Inner, target: ServerId) {
        if let Some(e) = inner.entry_mut(target) {
            if e.status != ServerStatus::Removed {
                e.update_version = e.verified_version;
            }
        }
        inner.last_scan.no_work_found_for_epoch = 0;
    }

    /// Reclaim every REMOVED entry whose removal version the freshly
    /// recomputed `min_confirmed_version` proves cluster-acknowledged.
    fn reclaim_confirmed_removals(&self, inner: &mut Inner) {
        for index in 0..inner.slots.len() {
            let confirmed = matches!(
                inner.slots[index].entry.as_ref(),
                Some(e) if e.status == ServerStatus::Removed
                    && e.update_version <= inner.min_confirmed_version
            );
            if confirmed {
                self.reclaim_slot(inner, index);
            }
        }
    }

    /// Free a slot whose occupant's removal the cluster has confirmed and
    /// retire its remaining durable log records.
    fn reclaim_slot(&self, inner: &mut Inner, index: usize) {
        let Some(entry) = inner.slots[index].entry.take() else {
            return;
        };
        let ids = entry.live_log_ids();
        if !ids.is_empty() {
            if let Err(error) = self.log.invalidate(&ids) {
                warn!(server_id = %entry.server_id, %error, "failed to retire log records for reclaimed slot");
            }
        }
        debug!(server_id = %entry.server_id, "slot reclaimed after cluster-wide remove acknowledgement");
    }
}
