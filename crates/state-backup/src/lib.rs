//! Interval snapshots of in-memory obligations, and the restart recovery
//! that turns a crashed region's orphaned sessions back into queued
//! payouts.
//!
//! The durable store is the preferred recovery source; the local JSON
//! snapshot is a fallback that is only trusted while fresh.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use arena_domain::{EndReason, RegionId, Session, SessionStatus};
use audit_log::{AuditEntry, AuditKind, AuditSink};
use fee_splitter::FeeSplitter;
use payout_store::{
    PendingFeesRecord, PendingFeesRepository, SessionSnapshotRecord, SessionSnapshotRepository,
};
use session_ledger::{LedgerError, PayoutSink, SessionLedger};

#[derive(Debug, Error)]
pub enum StateBackupError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub region: RegionId,
    pub taken_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
    pub fees: PendingFeesRecord,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub snapshot_path: PathBuf,
    pub snapshot_interval: Duration,
    /// A local snapshot older than this is discarded rather than trusted.
    pub max_snapshot_age: chrono::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotReport {
    pub sessions: usize,
    pub file_ok: bool,
    pub store_ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreReport {
    pub recovered: usize,
    pub fees_restored: bool,
    pub from_local_snapshot: bool,
}

#[must_use]
pub fn session_to_record(session: &Session) -> SessionSnapshotRecord {
    SessionSnapshotRecord {
        session_id: session.session_id,
        player: session.player.clone(),
        display_name: session.display_name.clone(),
        region: session.region.clone(),
        is_paid: session.is_paid,
        total_accrued: session.total_accrued,
        ledger: session.ledger.clone(),
        status: session.status,
        started_at: session.started_at,
        updated_at: Utc::now(),
    }
}

/// Rebuilds an orphaned snapshot as a synthetic ended session so the
/// payout queue treats it like any other ended session.
#[must_use]
pub fn record_to_recovered_session(record: &SessionSnapshotRecord) -> Session {
    Session {
        session_id: record.session_id,
        player: record.player.clone(),
        display_name: record.display_name.clone(),
        region: record.region.clone(),
        is_paid: record.is_paid,
        ledger: record.ledger.clone(),
        total_accrued: record.total_accrued,
        status: SessionStatus::Ended,
        end_reason: Some(EndReason::ServerRestart),
        started_at: record.started_at,
    }
}

#[derive(Clone)]
pub struct StateBackup {
    region: RegionId,
    cfg: BackupConfig,
    ledger: Arc<SessionLedger>,
    splitter: FeeSplitter,
    sessions_repo: Arc<dyn SessionSnapshotRepository>,
    fees_repo: Arc<dyn PendingFeesRepository>,
    audit: Arc<dyn AuditSink>,
}

impl StateBackup {
    #[must_use]
    pub fn new(
        region: RegionId,
        cfg: BackupConfig,
        ledger: Arc<SessionLedger>,
        splitter: FeeSplitter,
        sessions_repo: Arc<dyn SessionSnapshotRepository>,
        fees_repo: Arc<dyn PendingFeesRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            region,
            cfg,
            ledger,
            splitter,
            sessions_repo,
            fees_repo,
            audit,
        }
    }

    /// Writes one snapshot cycle: local file plus durable store. Either
    /// side may fail independently; the other still counts.
    pub async fn snapshot_once(&self) -> Result<SnapshotReport, StateBackupError> {
        let tracked = self.ledger.tracked_snapshot()?;
        let paid_sessions: Vec<Session> =
            tracked.into_iter().filter(|s| s.is_paid).collect();
        let records: Vec<SessionSnapshotRecord> =
            paid_sessions.iter().map(session_to_record).collect();
        let fees = self.splitter.pending_snapshot();

        let mut report = SnapshotReport {
            sessions: paid_sessions.len(),
            ..SnapshotReport::default()
        };

        let file = SnapshotFile {
            region: self.region.clone(),
            taken_at: Utc::now(),
            sessions: paid_sessions,
            fees: fees.clone(),
        };
        let body = serde_json::to_vec_pretty(&file)
            .map_err(|e| StateBackupError::Serialization(e.to_string()))?;
        match tokio::fs::write(&self.cfg.snapshot_path, body).await {
            Ok(()) => report.file_ok = true,
            Err(err) => warn!(error = %err, "local snapshot write failed"),
        }

        let store_sessions = self
            .sessions_repo
            .replace_region_sessions(&self.region, &records)
            .await;
        let store_fees = self.fees_repo.upsert_pending_fees(&fees).await;
        match (store_sessions, store_fees) {
            (Ok(()), Ok(())) => report.store_ok = true,
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "durable snapshot write failed");
            }
        }
        Ok(report)
    }

    /// Startup recovery. Orphaned sessions found in the durable store are
    /// re-queued exactly once; the local snapshot is consulted only when
    /// the store yielded nothing, and only while fresh.
    pub async fn restore(&self, sink: &dyn PayoutSink) -> Result<RestoreReport, StateBackupError> {
        let mut report = RestoreReport::default();

        let orphans = match self.sessions_repo.list_orphaned_sessions(&self.region).await {
            Ok(orphans) => orphans,
            Err(err) => {
                warn!(error = %err, "orphan query failed, treating store as empty");
                Vec::new()
            }
        };
        for record in &orphans {
            let session = record_to_recovered_session(record);
            info!(
                player = %session.player,
                total = %session.total_accrued,
                "orphaned session recovered, queueing payout"
            );
            self.ledger.track_recovered(session.clone())?;
            sink.enqueue(session.clone());
            if let Err(err) = self
                .sessions_repo
                .delete_session(&self.region, &record.player)
                .await
            {
                warn!(player = %record.player, error = %err, "orphan delete failed");
            }
            self.audit(AuditEntry::new(
                AuditKind::OrphanRecovered,
                self.region.clone(),
                json!({
                    "player": session.player,
                    "amount": session.total_accrued,
                    "source": "durable_store",
                }),
            ))
            .await;
            report.recovered += 1;
        }

        match self.fees_repo.get_pending_fees(&self.region).await {
            Ok(Some(fees)) => {
                if self.splitter.restore_pending(&fees).is_ok() {
                    report.fees_restored = true;
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "pending fees query failed"),
        }

        if report.recovered == 0 && !report.fees_restored {
            report = self.restore_from_local_snapshot(sink, report).await?;
        }
        Ok(report)
    }

    async fn restore_from_local_snapshot(
        &self,
        sink: &dyn PayoutSink,
        mut report: RestoreReport,
    ) -> Result<RestoreReport, StateBackupError> {
        let body = match tokio::fs::read(&self.cfg.snapshot_path).await {
            Ok(body) => body,
            Err(_) => return Ok(report),
        };
        let file: SnapshotFile = match serde_json::from_slice(&body) {
            Ok(file) => file,
            Err(err) => {
                warn!(error = %err, "local snapshot unreadable, ignored");
                return Ok(report);
            }
        };
        if file.region != self.region {
            warn!(snapshot_region = %file.region, "local snapshot belongs to another region, ignored");
            return Ok(report);
        }
        if Utc::now() - file.taken_at > self.cfg.max_snapshot_age {
            warn!(taken_at = %file.taken_at, "local snapshot too old, discarded");
            return Ok(report);
        }

        for session in &file.sessions {
            if !session.is_payable() {
                continue;
            }
            let mut session = session.clone();
            session.status = SessionStatus::Ended;
            session.end_reason = Some(EndReason::ServerRestart);
            info!(
                player = %session.player,
                total = %session.total_accrued,
                "session recovered from local snapshot, queueing payout"
            );
            self.ledger.track_recovered(session.clone())?;
            sink.enqueue(session.clone());
            self.audit(AuditEntry::new(
                AuditKind::OrphanRecovered,
                self.region.clone(),
                json!({
                    "player": session.player,
                    "amount": session.total_accrued,
                    "source": "local_snapshot",
                }),
            ))
            .await;
            report.recovered += 1;
            report.from_local_snapshot = true;
        }
        if self.splitter.restore_pending(&file.fees).is_ok()
            && !(file.fees.creator_share.is_zero() && file.fees.prize_pool.is_zero())
        {
            report.fees_restored = true;
            report.from_local_snapshot = true;
        }
        Ok(report)
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(entry).await {
            warn!(error = %err, "audit record failed");
        }
    }
}

pub fn spawn_snapshot_loop(
    backup: StateBackup,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(backup.cfg.snapshot_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("snapshot loop shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = backup.snapshot_once().await {
                        warn!(error = %err, "snapshot iteration failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use arena_domain::{Amount, PlayerId, RewardReason};
    use audit_log::InMemoryAuditSink;
    use fee_splitter::FeeConfig;
    use payout_store::InMemoryPayoutStore;
    use session_ledger::NoopAccrualNotifier;
    use uuid::Uuid;

    use super::*;

    #[derive(Debug, Default)]
    struct RecordingSink {
        sessions: Mutex<Vec<Session>>,
    }

    impl PayoutSink for RecordingSink {
        fn enqueue(&self, session: Session) {
            self.sessions.lock().expect("lock").push(session);
        }
    }

    struct Fixture {
        region: RegionId,
        store: Arc<InMemoryPayoutStore>,
        ledger: Arc<SessionLedger>,
        splitter: FeeSplitter,
        backup: StateBackup,
        snapshot_path: PathBuf,
    }

    fn fixture_with(store: Arc<InMemoryPayoutStore>, snapshot_path: PathBuf) -> Fixture {
        let region = RegionId::from("eu-1");
        let ledger = Arc::new(SessionLedger::new(
            region.clone(),
            Arc::new(RecordingSink::default()),
            Arc::new(NoopAccrualNotifier),
        ));
        let splitter = FeeSplitter::new(region.clone(), FeeConfig::default());
        let backup = StateBackup::new(
            region.clone(),
            BackupConfig {
                snapshot_path: snapshot_path.clone(),
                snapshot_interval: Duration::from_secs(30),
                max_snapshot_age: chrono::Duration::minutes(10),
            },
            ledger.clone(),
            splitter.clone(),
            store.clone(),
            store.clone(),
            Arc::new(InMemoryAuditSink::new()),
        );
        Fixture {
            region,
            store,
            ledger,
            splitter,
            backup,
            snapshot_path,
        }
    }

    fn fixture() -> Fixture {
        let path = std::env::temp_dir().join(format!("state-snapshot-{}.json", Uuid::now_v7()));
        fixture_with(Arc::new(InMemoryPayoutStore::new()), path)
    }

    fn seed_paid_session(fx: &Fixture, player: &str, amount: u64) {
        let player = PlayerId::from(player);
        fx.ledger
            .start_session(player.clone(), player.as_str().to_string(), true)
            .expect("start");
        fx.ledger
            .accrue(&player, Amount(amount), RewardReason::Tier { tier: 1 })
            .expect("accrue");
    }

    #[tokio::test]
    async fn snapshot_persists_paid_sessions_and_fees_to_both_targets() {
        let fx = fixture();
        seed_paid_session(&fx, "paid", 125);
        fx.ledger
            .start_session(PlayerId::from("free"), "Free", false)
            .expect("start");
        fx.splitter
            .record_buy_in(&PlayerId::from("paid"))
            .expect("buy-in");

        let report = fx.backup.snapshot_once().await.expect("snapshot");
        assert_eq!(
            report,
            SnapshotReport {
                sessions: 1,
                file_ok: true,
                store_ok: true,
            }
        );

        let orphans = fx
            .store
            .list_orphaned_sessions(&fx.region)
            .await
            .expect("list");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].player, PlayerId::from("paid"));
        assert!(fx.snapshot_path.exists());
        assert!(fx
            .store
            .get_pending_fees(&fx.region)
            .await
            .expect("fees")
            .is_some());

        let _ = tokio::fs::remove_file(&fx.snapshot_path).await;
    }

    #[tokio::test]
    async fn restore_requeues_each_orphan_exactly_once() {
        let fx = fixture();
        seed_paid_session(&fx, "orphan", 125);
        fx.backup.snapshot_once().await.expect("snapshot");

        // Fresh process: same store and snapshot file, empty ledger.
        let restarted = fixture_with(fx.store.clone(), fx.snapshot_path.clone());
        let sink = RecordingSink::default();
        let report = restarted.backup.restore(&sink).await.expect("restore");
        assert_eq!(report.recovered, 1);
        assert!(!report.from_local_snapshot);

        let recovered = sink.sessions.lock().expect("lock");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].player, PlayerId::from("orphan"));
        assert_eq!(recovered[0].status, SessionStatus::Ended);
        assert_eq!(recovered[0].end_reason, Some(EndReason::ServerRestart));
        assert_eq!(recovered[0].total_accrued, Amount(125));
        drop(recovered);
        // Recovered obligations stay under backup coverage until settled.
        assert_eq!(restarted.ledger.tracked_count().expect("count"), 1);

        // Deleted from the store exactly once: nothing left for a second
        // restore.
        let again = fixture_with(fx.store.clone(), fx.snapshot_path.clone());
        let sink = RecordingSink::default();
        let report = again.backup.restore(&sink).await.expect("restore");
        assert_eq!(report.recovered, 0);
        assert!(sink.sessions.lock().expect("lock").is_empty());

        let _ = tokio::fs::remove_file(&fx.snapshot_path).await;
    }

    #[tokio::test]
    async fn restore_falls_back_to_fresh_local_snapshot_only_when_store_is_empty() {
        let fx = fixture();
        seed_paid_session(&fx, "local-only", 300);
        fx.splitter
            .record_buy_in(&PlayerId::from("local-only"))
            .expect("buy-in");
        fx.backup.snapshot_once().await.expect("snapshot");

        // Same file, but a brand-new (empty) durable store.
        let restarted = fixture_with(Arc::new(InMemoryPayoutStore::new()), fx.snapshot_path.clone());
        let sink = RecordingSink::default();
        let report = restarted.backup.restore(&sink).await.expect("restore");
        assert_eq!(report.recovered, 1);
        assert!(report.from_local_snapshot);
        assert!(report.fees_restored);
        assert_eq!(
            sink.sessions.lock().expect("lock")[0].end_reason,
            Some(EndReason::ServerRestart)
        );

        let _ = tokio::fs::remove_file(&fx.snapshot_path).await;
    }

    #[tokio::test]
    async fn store_contents_win_over_the_local_snapshot() {
        let fx = fixture();
        seed_paid_session(&fx, "in-file", 100);
        fx.backup.snapshot_once().await.expect("snapshot");

        // The store has moved on: only a different orphan remains.
        fx.store
            .replace_region_sessions(
                &fx.region,
                &[payout_store::SessionSnapshotRecord {
                    session_id: arena_domain::SessionId::new(),
                    player: PlayerId::from("in-store"),
                    display_name: "InStore".to_string(),
                    region: fx.region.clone(),
                    is_paid: true,
                    total_accrued: Amount(42),
                    ledger: Vec::new(),
                    status: SessionStatus::Active,
                    started_at: Utc::now(),
                    updated_at: Utc::now(),
                }],
            )
            .await
            .expect("replace");

        let restarted = fixture_with(fx.store.clone(), fx.snapshot_path.clone());
        let sink = RecordingSink::default();
        let report = restarted.backup.restore(&sink).await.expect("restore");
        assert_eq!(report.recovered, 1);
        assert!(!report.from_local_snapshot);
        assert_eq!(
            sink.sessions.lock().expect("lock")[0].player,
            PlayerId::from("in-store")
        );

        let _ = tokio::fs::remove_file(&fx.snapshot_path).await;
    }

    #[tokio::test]
    async fn stale_local_snapshot_is_discarded() {
        let fx = fixture();
        let stale = SnapshotFile {
            region: fx.region.clone(),
            taken_at: Utc::now() - chrono::Duration::hours(2),
            sessions: vec![{
                let mut s = Session::new(
                    PlayerId::from("stale"),
                    "Stale",
                    fx.region.clone(),
                    true,
                );
                s.credit(Amount(10), RewardReason::Tier { tier: 1 })
                    .expect("credit");
                s
            }],
            fees: PendingFeesRecord {
                region: fx.region.clone(),
                creator_share: Amount(5),
                prize_pool: Amount(5),
                updated_at: Utc::now(),
            },
        };
        tokio::fs::write(
            &fx.snapshot_path,
            serde_json::to_vec(&stale).expect("serialize"),
        )
        .await
        .expect("write");

        let sink = RecordingSink::default();
        let report = fx.backup.restore(&sink).await.expect("restore");
        assert_eq!(report, RestoreReport::default());
        assert!(sink.sessions.lock().expect("lock").is_empty());

        let _ = tokio::fs::remove_file(&fx.snapshot_path).await;
    }
}
