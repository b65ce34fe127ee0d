use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use arena_domain::{Amount, EndReason, PlayerId, RewardReason, SessionId};
use fee_splitter::{FeeError, FeeSplitter};
use replay_guard::{BuyInClaim, ClaimVerdict, ReplayGuard, ReplayGuardError};
use session_ledger::{LedgerError, SessionLedger};

#[derive(Debug, Error)]
pub enum GameEventError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Fees(#[from] FeeError),
    #[error(transparent)]
    Replay(#[from] ReplayGuardError),
}

/// The game-event surface consumed by the simulation layer: buy-ins in,
/// accruals and session endings through to the payout machinery.
#[derive(Clone)]
pub struct GameEvents {
    ledger: Arc<SessionLedger>,
    splitter: FeeSplitter,
    guard: ReplayGuard,
    buy_in: Amount,
}

impl GameEvents {
    #[must_use]
    pub fn new(
        ledger: Arc<SessionLedger>,
        splitter: FeeSplitter,
        guard: ReplayGuard,
        buy_in: Amount,
    ) -> Self {
        Self {
            ledger,
            splitter,
            guard,
            buy_in,
        }
    }

    /// Verifies the claimed buy-in transaction; only a verified claim
    /// yields a paid session and fee accumulation.
    pub async fn player_buy_in(
        &self,
        player: PlayerId,
        display_name: &str,
        signature: String,
    ) -> Result<ClaimVerdict, GameEventError> {
        let verdict = self
            .guard
            .verify_claim(&BuyInClaim {
                signature,
                player: player.clone(),
                expected_amount: self.buy_in,
            })
            .await?;
        if verdict.is_verified() {
            self.splitter.record_buy_in(&player)?;
            let session_id = self
                .ledger
                .start_session(player.clone(), display_name, true)?;
            info!(player = %player, session_id = %session_id, "paid session opened");
        }
        Ok(verdict)
    }

    /// Free players get a tracked session that never accrues.
    pub fn free_spawn(
        &self,
        player: PlayerId,
        display_name: &str,
    ) -> Result<SessionId, GameEventError> {
        Ok(self.ledger.start_session(player, display_name, false)?)
    }

    pub fn reward_tier(
        &self,
        player: &PlayerId,
        amount: Amount,
        tier: u8,
    ) -> Result<Option<Amount>, GameEventError> {
        Ok(self
            .ledger
            .accrue(player, amount, RewardReason::Tier { tier })?)
    }

    pub fn reward_bonus(
        &self,
        player: &PlayerId,
        amount: Amount,
        label: impl Into<String>,
    ) -> Result<Option<Amount>, GameEventError> {
        Ok(self.ledger.accrue(
            player,
            amount,
            RewardReason::Bonus {
                label: label.into(),
            },
        )?)
    }

    /// Credits the killer and bumps the interval leaderboard, whether or
    /// not the killer is a paying player.
    pub fn record_kill(
        &self,
        killer: &PlayerId,
        victim: PlayerId,
        credit: Amount,
    ) -> Result<Option<Amount>, GameEventError> {
        self.splitter.record_kill(killer)?;
        Ok(self
            .ledger
            .accrue(killer, credit, RewardReason::KillCredit { victim })?)
    }

    pub fn player_death(&self, player: &PlayerId) -> Result<bool, GameEventError> {
        Ok(self.ledger.end_session(player, EndReason::Death)?)
    }

    pub fn player_cashout(&self, player: &PlayerId) -> Result<bool, GameEventError> {
        Ok(self.ledger.end_session(player, EndReason::Cashout)?)
    }

    pub fn player_disconnect(&self, player: &PlayerId) -> Result<bool, GameEventError> {
        Ok(self.ledger.handle_disconnect(player)?)
    }
}
