//! Outbound transport interface for membership updates.
//!
//! The coordinator pushes server list updates to each member through a
//! single call: send an ordered batch of updates (optionally led by a full
//! snapshot) and observe one of three outcomes. The RPC substrate itself
//! is out of scope; [`MockTransport`] provides the scriptable double used
//! throughout the test suites.

use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::id::ServerId;
use crate::proto::ServerListUpdate;

/// Result of one update RPC, as observed by the updater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The target applied the batch and now holds `version`.
    Acked {
        /// The list version the target confirmed.
        version: u64,
    },
    /// The RPC failed or timed out; the work is rolled back and retried.
    Failed,
    /// The transport no longer knows the target. No further updates need
    /// to be sent to it.
    TargetGone,
}

/// Transport used by the updater to push server list updates.
///
/// `lists` is ordered: an optional full snapshot first, then incremental
/// updates in strictly increasing, gap-free version order. The call blocks
/// until the RPC resolves; the coordinator lock is never held across it.
pub trait MembershipTransport: Send + Sync {
    /// Send one batched update RPC to `target`.
    fn send_server_list_update(&self, target: ServerId, lists: &[ServerListUpdate])
        -> UpdateOutcome;
}

/// One recorded RPC made through a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The server the batch was sent to.
    pub target: ServerId,
    /// The batch, in the order it was sent.
    pub lists: Vec<ServerListUpdate>,
}

impl Delivery {
    /// The highest version carried by this delivery.
    pub fn delivered_version(&self) -> u64 {
        self.lists.last().map(|l| l.version_number).unwrap_or(0)
    }
}

/// Scriptable in-memory transport.
///
/// By default every RPC is acknowledged at the highest version it carries.
/// Failures and gone-targets can be scripted per target; each scripted
/// outcome is consumed by one RPC.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    deliveries: Vec<Delivery>,
    scripted: HashMap<ServerId, VecDeque<UpdateOutcome>>,
    gone: Vec<ServerId>,
}

impl MockTransport {
    /// Create a transport that acknowledges everything.
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Script the next outcome for `target`; outcomes queue in FIFO order.
    pub fn script(&self, target: ServerId, outcome: UpdateOutcome) {
        self.state
            .lock()
            .scripted
            .entry(target)
            .or_default()
            .push_back(outcome);
    }

    /// Make every future RPC to `target` resolve as [`UpdateOutcome::TargetGone`].
    pub fn mark_gone(&self, target: ServerId) {
        self.state.lock().gone.push(target);
    }

    /// All RPCs recorded so far, in send order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    /// The acknowledged versions delivered to `target`, in send order.
    pub fn delivered_versions(&self, target: ServerId) -> Vec<u64> {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|d| d.target == target)
            .map(Delivery::delivered_version)
            .collect()
    }

    /// Forget all recorded deliveries.
    pub fn clear(&self) {
        self.state.lock().deliveries.clear();
    }
}

impl MembershipTransport for MockTransport {
    fn send_server_list_update(
        &self,
        target: ServerId,
        lists: &[ServerListUpdate],
    ) -> UpdateOutcome {
        let mut state = self.state.lock();
        state.deliveries.push(Delivery {
            target,
            lists: lists.to_vec(),
        });
        if state.gone.contains(&target) {
            return UpdateOutcome::TargetGone;
        }
        if let Some(queue) = state.scripted.get_mut(&target) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        let version = lists.last().map(|l| l.version_number).unwrap_or(0);
        UpdateOutcome::Acked { version }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(version: u64) -> ServerListUpdate {
        ServerListUpdate {
            version_number: version,
            ..Default::default()
        }
    }

    #[test]
    fn test_mock_acks_highest_version_by_default() {
        let transport = MockTransport::new();
        let target = ServerId::new(0, 1);
        let outcome = transport.send_server_list_update(target, &[update(3), update(4)]);
        assert_eq!(outcome, UpdateOutcome::Acked { version: 4 });
        assert_eq!(transport.delivered_versions(target), vec![4]);
    }

    #[test]
    fn test_scripted_outcomes_are_consumed_in_order() {
        let transport = MockTransport::new();
        let target = ServerId::new(1, 1);
        transport.script(target, UpdateOutcome::Failed);
        assert_eq!(
            transport.send_server_list_update(target, &[update(1)]),
            UpdateOutcome::Failed
        );
        assert_eq!(
            transport.send_server_list_update(target, &[update(1)]),
            UpdateOutcome::Acked { version: 1 }
        );
    }

    #[test]
    fn test_gone_target_stays_gone() {
        let transport = MockTransport::new();
        let target = ServerId::new(2, 1);
        transport.mark_gone(target);
        assert_eq!(
            transport.send_server_list_update(target, &[update(1)]),
            UpdateOutcome::TargetGone
        );
        assert_eq!(
            transport.send_server_list_update(target, &[update(2)]),
            UpdateOutcome::TargetGone
        );
    }
}
