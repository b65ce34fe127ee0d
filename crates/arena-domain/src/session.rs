use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PlayerId, RegionId, SessionId};
use crate::money::{Amount, MoneyError};
use crate::reward::RewardReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Paid,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Death,
    Disconnect,
    Cashout,
    ServerRestart,
}

/// One immutable "you are owed X because Y" record within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub amount: Amount,
    pub reason: RewardReason,
    pub at: DateTime<Utc>,
}

/// One paying player's tracked obligation for one game round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub player: PlayerId,
    pub display_name: String,
    pub region: RegionId,
    pub is_paid: bool,
    pub ledger: Vec<LedgerEntry>,
    pub total_accrued: Amount,
    pub status: SessionStatus,
    pub end_reason: Option<EndReason>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new(player: PlayerId, display_name: impl Into<String>, region: RegionId, is_paid: bool) -> Self {
        Self {
            session_id: SessionId::new(),
            player,
            display_name: display_name.into(),
            region,
            is_paid,
            ledger: Vec::new(),
            total_accrued: Amount::ZERO,
            status: SessionStatus::Active,
            end_reason: None,
            started_at: Utc::now(),
        }
    }

    /// Appends a ledger entry and bumps the running total. The total only
    /// ever grows; entries are never edited or removed.
    pub fn credit(&mut self, amount: Amount, reason: RewardReason) -> Result<Amount, MoneyError> {
        self.total_accrued = self.total_accrued.checked_add(amount)?;
        self.ledger.push(LedgerEntry {
            amount,
            reason,
            at: Utc::now(),
        });
        Ok(self.total_accrued)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Paid-eligible means a payout attempt must eventually happen for it.
    #[must_use]
    pub fn is_payable(&self) -> bool {
        self.is_paid && !self.total_accrued.is_zero()
    }
}
