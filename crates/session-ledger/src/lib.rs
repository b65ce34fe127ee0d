//! In-memory ledger of live paying sessions for one server region.
//!
//! Sessions stay tracked here from spawn until their payout attempt
//! completes; the ended-but-unsettled window is covered by the state
//! backup, so a crash between accrual and settlement never erases the
//! obligation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use arena_domain::{Amount, EndReason, PlayerId, RegionId, RewardReason, Session, SessionId, SessionStatus};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("session store lock poisoned")]
    LockPoisoned,
}

/// Receives ended, payable sessions. Implemented by the payout queue.
pub trait PayoutSink: Send + Sync {
    fn enqueue(&self, session: Session);
}

/// Surfaces the new running total to the player after each accrual.
pub trait AccrualNotifier: Send + Sync {
    fn accrual_update(&self, session: &Session, credited: Amount, reason: &RewardReason);
}

#[derive(Debug, Default)]
pub struct NoopAccrualNotifier;

impl AccrualNotifier for NoopAccrualNotifier {
    fn accrual_update(&self, _session: &Session, _credited: Amount, _reason: &RewardReason) {}
}

/// Removal hook used by the payout pipeline once a session reaches a
/// terminal state.
pub trait ActiveTracking: Send + Sync {
    fn remove(&self, player: &PlayerId);
}

pub struct SessionLedger {
    region: RegionId,
    sessions: Arc<Mutex<HashMap<PlayerId, Session>>>,
    payout_sink: Arc<dyn PayoutSink>,
    notifier: Arc<dyn AccrualNotifier>,
}

impl SessionLedger {
    #[must_use]
    pub fn new(
        region: RegionId,
        payout_sink: Arc<dyn PayoutSink>,
        notifier: Arc<dyn AccrualNotifier>,
    ) -> Self {
        Self {
            region,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            payout_sink,
            notifier,
        }
    }

    #[must_use]
    pub fn region(&self) -> &RegionId {
        &self.region
    }

    /// Creates an `Active` session for the player. Free sessions are
    /// tracked for gameplay but never accrue. Starting again while a
    /// session is still tracked keeps the existing one so accrued value
    /// cannot be wiped by a respawn race.
    pub fn start_session(
        &self,
        player: PlayerId,
        display_name: impl Into<String>,
        is_paid: bool,
    ) -> Result<SessionId, LedgerError> {
        let mut guard = self.sessions.lock().map_err(|_| LedgerError::LockPoisoned)?;
        if let Some(existing) = guard.get(&player) {
            warn!(player = %player, "start_session while previous session still tracked");
            return Ok(existing.session_id);
        }
        let session = Session::new(player.clone(), display_name, self.region.clone(), is_paid);
        let session_id = session.session_id;
        info!(player = %player, is_paid, "session started");
        guard.insert(player, session);
        Ok(session_id)
    }

    /// Appends a ledger entry and returns the new running total, or `None`
    /// when the session is missing, not active, or not paid.
    pub fn accrue(
        &self,
        player: &PlayerId,
        amount: Amount,
        reason: RewardReason,
    ) -> Result<Option<Amount>, LedgerError> {
        let mut guard = self.sessions.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let Some(session) = guard.get_mut(player) else {
            debug!(player = %player, "accrue ignored: no session");
            return Ok(None);
        };
        if !session.is_active() || !session.is_paid {
            debug!(player = %player, "accrue ignored: session not active or not paid");
            return Ok(None);
        }
        let total = match session.credit(amount, reason.clone()) {
            Ok(total) => total,
            Err(err) => {
                warn!(player = %player, error = %err, "accrue rejected");
                return Ok(None);
            }
        };
        self.notifier.accrual_update(session, amount, &reason);
        Ok(Some(total))
    }

    /// One-shot transition to `Ended`. Payable sessions are handed to the
    /// payout queue and stay tracked until settlement; the rest are
    /// discarded immediately. A second call for the same session is a
    /// no-op.
    pub fn end_session(&self, player: &PlayerId, reason: EndReason) -> Result<bool, LedgerError> {
        let mut guard = self.sessions.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let Some(session) = guard.get_mut(player) else {
            return Ok(false);
        };
        if session.status != SessionStatus::Active {
            debug!(player = %player, "end_session ignored: already ended");
            return Ok(false);
        }
        session.status = SessionStatus::Ended;
        session.end_reason = Some(reason);

        if session.is_payable() {
            info!(
                player = %player,
                total = %session.total_accrued,
                ?reason,
                "session ended, queueing payout"
            );
            self.payout_sink.enqueue(session.clone());
            Ok(true)
        } else {
            debug!(player = %player, "session ended with nothing owed, discarded");
            guard.remove(player);
            Ok(false)
        }
    }

    /// A player who vanishes mid-game is still paid whatever they accrued.
    pub fn handle_disconnect(&self, player: &PlayerId) -> Result<bool, LedgerError> {
        self.end_session(player, EndReason::Disconnect)
    }

    /// Re-admits a session recovered from persisted state so it stays
    /// covered by the backup loop until its payout completes.
    pub fn track_recovered(&self, session: Session) -> Result<(), LedgerError> {
        let mut guard = self.sessions.lock().map_err(|_| LedgerError::LockPoisoned)?;
        guard.entry(session.player.clone()).or_insert(session);
        Ok(())
    }

    /// Point-in-time copy of every tracked session, including ended ones
    /// still awaiting settlement. This is what the state backup persists.
    pub fn tracked_snapshot(&self) -> Result<Vec<Session>, LedgerError> {
        let guard = self.sessions.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(guard.values().cloned().collect())
    }

    pub fn tracked_count(&self) -> Result<usize, LedgerError> {
        Ok(self
            .sessions
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?
            .len())
    }
}

impl ActiveTracking for SessionLedger {
    fn remove(&self, player: &PlayerId) {
        if let Ok(mut guard) = self.sessions.lock() {
            guard.remove(player);
        }
    }
}
