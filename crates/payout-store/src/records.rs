use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use arena_domain::{Amount, LedgerEntry, PlayerId, RegionId, SessionId, SessionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshotRecord {
    pub session_id: SessionId,
    pub player: PlayerId,
    pub display_name: String,
    pub region: RegionId,
    pub is_paid: bool,
    pub total_accrued: Amount,
    pub ledger: Vec<LedgerEntry>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFeesRecord {
    pub region: RegionId,
    pub creator_share: Amount,
    pub prize_pool: Amount,
    pub updated_at: DateTime<Utc>,
}

/// Dedup record: once stored, the transaction behind `signature` can never
/// be credited again, from any region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedSignatureRecord {
    pub signature: String,
    pub payer: PlayerId,
    pub amount: Amount,
    pub purpose: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMirrorRecord {
    pub audit_entry_id: Uuid,
    pub kind: String,
    pub region: RegionId,
    pub at: DateTime<Utc>,
    pub payload: Value,
}
