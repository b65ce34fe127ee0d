use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::warn;

use arena_domain::{PlayerId, Session, SessionId};
use session_ledger::PayoutSink;

#[derive(Debug, Clone)]
pub struct PendingPayout {
    pub session: Session,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct FailedPayout {
    pub session: Session,
    pub error: String,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PendingPayout>,
    // Terminal session ids; duplicate queue entries for these are skipped
    // so a session can never settle twice.
    completed: HashSet<SessionId>,
    failed: Vec<FailedPayout>,
}

/// FIFO of ended sessions awaiting settlement. Retried sessions re-enter
/// at the front; permanently failed ones stay visible to operators.
#[derive(Debug, Default, Clone)]
pub struct PayoutQueue {
    state: Arc<Mutex<QueueState>>,
}

impl PayoutQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending_players(&self) -> Vec<PlayerId> {
        self.state
            .lock()
            .map(|s| s.pending.iter().map(|p| p.session.player.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn failed_payouts(&self) -> Vec<FailedPayout> {
        self.state
            .lock()
            .map(|s| s.failed.clone())
            .unwrap_or_default()
    }

    pub(crate) fn pop_front(&self) -> Option<PendingPayout> {
        self.state.lock().ok()?.pending.pop_front()
    }

    pub(crate) fn requeue_front(&self, pending: PendingPayout) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.push_front(pending);
        }
    }

    pub(crate) fn is_completed(&self, session_id: SessionId) -> bool {
        self.state
            .lock()
            .map(|s| s.completed.contains(&session_id))
            .unwrap_or(false)
    }

    pub(crate) fn mark_completed(&self, session_id: SessionId) {
        if let Ok(mut state) = self.state.lock() {
            state.completed.insert(session_id);
        }
    }

    pub(crate) fn mark_failed(&self, session: Session, error: String) {
        if let Ok(mut state) = self.state.lock() {
            state.completed.insert(session.session_id);
            state.failed.push(FailedPayout { session, error });
        }
    }
}

impl PayoutSink for PayoutQueue {
    fn enqueue(&self, session: Session) {
        match self.state.lock() {
            Ok(mut state) => {
                state.pending.push_back(PendingPayout {
                    session,
                    attempts: 0,
                });
            }
            Err(_) => warn!("payout queue lock poisoned, dropping enqueue"),
        }
    }
}
