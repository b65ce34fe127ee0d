//! Durable-store contract shared by every server region.
//!
//! The relational database behind these traits is the only data shared
//! across regions, so any decision that must be globally exactly-once
//! (signature dedup, orphan-session recovery) goes through here rather
//! than through process-local state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod postgres;
mod records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use arena_domain::{PlayerId, RegionId};

pub use postgres::PostgresPayoutStore;
pub use records::{
    AuditMirrorRecord, PendingFeesRecord, SessionSnapshotRecord, VerifiedSignatureRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Session snapshots keyed by `(region, player)`. `replace_region_sessions`
/// makes each snapshot cycle authoritative for its region; individual
/// deletes cover the window between payout completion and the next cycle.
#[async_trait]
pub trait SessionSnapshotRepository: Send + Sync {
    async fn replace_region_sessions(
        &self,
        region: &RegionId,
        records: &[SessionSnapshotRecord],
    ) -> Result<(), StoreError>;

    async fn delete_session(&self, region: &RegionId, player: &PlayerId)
        -> Result<(), StoreError>;

    /// Sessions left behind by a crashed process: paid-eligible with
    /// nonzero accrual, still marked active in the store.
    async fn list_orphaned_sessions(
        &self,
        region: &RegionId,
    ) -> Result<Vec<SessionSnapshotRecord>, StoreError>;
}

#[async_trait]
pub trait PendingFeesRepository: Send + Sync {
    async fn upsert_pending_fees(&self, record: &PendingFeesRecord) -> Result<(), StoreError>;

    async fn get_pending_fees(
        &self,
        region: &RegionId,
    ) -> Result<Option<PendingFeesRecord>, StoreError>;
}

#[async_trait]
pub trait SignatureRepository: Send + Sync {
    async fn signature_exists(&self, signature: &str) -> Result<bool, StoreError>;

    /// Returns false when another region recorded the signature first.
    async fn record_signature(
        &self,
        record: &VerifiedSignatureRecord,
    ) -> Result<bool, StoreError>;

    /// On-chain history covers anything older than the replay window, so
    /// records past the cutoff can be dropped.
    async fn delete_signatures_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait AuditMirrorRepository: Send + Sync {
    async fn insert_audit_entry(&self, record: &AuditMirrorRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryPayoutStore {
    pub sessions: Arc<Mutex<HashMap<(RegionId, PlayerId), SessionSnapshotRecord>>>,
    pub pending_fees: Arc<Mutex<HashMap<RegionId, PendingFeesRecord>>>,
    pub signatures: Arc<Mutex<HashMap<String, VerifiedSignatureRecord>>>,
    pub audit_entries: Arc<Mutex<Vec<AuditMirrorRecord>>>,
}

impl InMemoryPayoutStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionSnapshotRepository for InMemoryPayoutStore {
    async fn replace_region_sessions(
        &self,
        region: &RegionId,
        records: &[SessionSnapshotRecord],
    ) -> Result<(), StoreError> {
        let mut guard = self.sessions.lock().map_err(|_| StoreError::LockPoisoned)?;
        guard.retain(|(r, _), _| r != region);
        for record in records {
            guard.insert((region.clone(), record.player.clone()), record.clone());
        }
        Ok(())
    }

    async fn delete_session(
        &self,
        region: &RegionId,
        player: &PlayerId,
    ) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(&(region.clone(), player.clone()));
        Ok(())
    }

    async fn list_orphaned_sessions(
        &self,
        region: &RegionId,
    ) -> Result<Vec<SessionSnapshotRecord>, StoreError> {
        let guard = self.sessions.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard
            .iter()
            .filter(|((r, _), record)| r == region && record.is_paid && record.total_accrued.0 > 0)
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl PendingFeesRepository for InMemoryPayoutStore {
    async fn upsert_pending_fees(&self, record: &PendingFeesRecord) -> Result<(), StoreError> {
        self.pending_fees
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(record.region.clone(), record.clone());
        Ok(())
    }

    async fn get_pending_fees(
        &self,
        region: &RegionId,
    ) -> Result<Option<PendingFeesRecord>, StoreError> {
        Ok(self
            .pending_fees
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .get(region)
            .cloned())
    }
}

#[async_trait]
impl SignatureRepository for InMemoryPayoutStore {
    async fn signature_exists(&self, signature: &str) -> Result<bool, StoreError> {
        Ok(self
            .signatures
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .contains_key(signature))
    }

    async fn record_signature(
        &self,
        record: &VerifiedSignatureRecord,
    ) -> Result<bool, StoreError> {
        let mut guard = self
            .signatures
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        if guard.contains_key(&record.signature) {
            return Ok(false);
        }
        guard.insert(record.signature.clone(), record.clone());
        Ok(true)
    }

    async fn delete_signatures_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut guard = self
            .signatures
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?;
        let before = guard.len();
        guard.retain(|_, record| record.created_at >= cutoff);
        Ok(before - guard.len())
    }
}

#[async_trait]
impl AuditMirrorRepository for InMemoryPayoutStore {
    async fn insert_audit_entry(&self, record: &AuditMirrorRecord) -> Result<(), StoreError> {
        self.audit_entries
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arena_domain::{Amount, SessionStatus};
    use chrono::Duration;

    use super::*;

    fn snapshot(player: &str, region: &str, is_paid: bool, total: u64) -> SessionSnapshotRecord {
        SessionSnapshotRecord {
            session_id: arena_domain::SessionId::new(),
            player: PlayerId::from(player),
            display_name: player.to_string(),
            region: RegionId::from(region),
            is_paid,
            total_accrued: Amount(total),
            ledger: Vec::new(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn orphan_listing_filters_unpaid_and_zero_accrual() {
        let store = InMemoryPayoutStore::new();
        let region = RegionId::from("eu-1");
        store
            .replace_region_sessions(
                &region,
                &[
                    snapshot("paid-owed", "eu-1", true, 125),
                    snapshot("paid-zero", "eu-1", true, 0),
                    snapshot("free", "eu-1", false, 500),
                ],
            )
            .await
            .expect("replace");

        let orphans = store.list_orphaned_sessions(&region).await.expect("list");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].player, PlayerId::from("paid-owed"));
    }

    #[tokio::test]
    async fn replace_region_sessions_is_authoritative_per_region() {
        let store = InMemoryPayoutStore::new();
        let eu = RegionId::from("eu-1");
        let us = RegionId::from("us-1");
        store
            .replace_region_sessions(&eu, &[snapshot("a", "eu-1", true, 10)])
            .await
            .expect("replace eu");
        store
            .replace_region_sessions(&us, &[snapshot("b", "us-1", true, 10)])
            .await
            .expect("replace us");

        // A later empty snapshot clears only its own region.
        store
            .replace_region_sessions(&eu, &[])
            .await
            .expect("replace eu empty");
        assert!(store
            .list_orphaned_sessions(&eu)
            .await
            .expect("list eu")
            .is_empty());
        assert_eq!(
            store.list_orphaned_sessions(&us).await.expect("list us").len(),
            1
        );
    }

    #[tokio::test]
    async fn record_signature_is_first_writer_wins() {
        let store = InMemoryPayoutStore::new();
        let record = VerifiedSignatureRecord {
            signature: "sig-1".to_string(),
            payer: PlayerId::from("p1"),
            amount: Amount(100),
            purpose: "buy_in".to_string(),
            created_at: Utc::now(),
        };
        assert!(store.record_signature(&record).await.expect("first"));
        assert!(!store.record_signature(&record).await.expect("second"));
        assert!(store.signature_exists("sig-1").await.expect("exists"));
    }

    #[tokio::test]
    async fn signature_retention_drops_records_past_cutoff() {
        let store = InMemoryPayoutStore::new();
        let old = VerifiedSignatureRecord {
            signature: "old".to_string(),
            payer: PlayerId::from("p1"),
            amount: Amount(100),
            purpose: "buy_in".to_string(),
            created_at: Utc::now() - Duration::hours(48),
        };
        let fresh = VerifiedSignatureRecord {
            signature: "fresh".to_string(),
            created_at: Utc::now(),
            ..old.clone()
        };
        store.record_signature(&old).await.expect("old");
        store.record_signature(&fresh).await.expect("fresh");

        let dropped = store
            .delete_signatures_before(Utc::now() - Duration::hours(24))
            .await
            .expect("prune");
        assert_eq!(dropped, 1);
        assert!(!store.signature_exists("old").await.expect("exists"));
        assert!(store.signature_exists("fresh").await.expect("exists"));
    }
}
