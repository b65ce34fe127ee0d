//! Durable payout pipeline: one settlement attempt at a time, bounded
//! retries with front-of-queue requeue, permanent failures escalated and
//! kept visible.

mod queue;
mod wallet;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use arena_domain::{Amount, PlayerId, SessionStatus};
use audit_log::{AuditEntry, AuditKind, AuditSink};
use payout_store::SessionSnapshotRepository;
use session_ledger::ActiveTracking;

pub use queue::{FailedPayout, PayoutQueue, PendingPayout};
pub use wallet::{InMemoryWallet, WalletPort, WalletTransfer};

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    pub max_retries: u32,
    pub drain_interval: Duration,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            drain_interval: Duration::from_secs(5),
        }
    }
}

/// Outward notifications for settled and permanently failed payouts.
/// Delivery failures are logged and never retried.
#[async_trait]
pub trait PayoutNotifier: Send + Sync {
    async fn payout_succeeded(
        &self,
        session: &arena_domain::Session,
        transfer_id: &str,
    ) -> Result<(), String>;

    async fn payout_failed(
        &self,
        session: &arena_domain::Session,
        error: &str,
    ) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct NoopPayoutNotifier;

#[async_trait]
impl PayoutNotifier for NoopPayoutNotifier {
    async fn payout_succeeded(
        &self,
        _session: &arena_domain::Session,
        _transfer_id: &str,
    ) -> Result<(), String> {
        Ok(())
    }

    async fn payout_failed(
        &self,
        _session: &arena_domain::Session,
        _error: &str,
    ) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Idle,
    Settled {
        player: PlayerId,
        amount: Amount,
        transfer_id: String,
    },
    Retried {
        player: PlayerId,
        attempts: u32,
    },
    FailedPermanently {
        player: PlayerId,
    },
    SkippedDuplicate {
        player: PlayerId,
    },
}

async fn record_audit(audit: &dyn AuditSink, entry: AuditEntry) {
    // Payouts never block on audit problems; the attempt itself is the
    // critical operation.
    if let Err(err) = audit.record(entry).await {
        warn!(error = %err, "audit record failed");
    }
}

/// Settles at most one queued session. Called once per drain tick, so a
/// retrying session is paced by the tick interval rather than spinning.
pub async fn settle_next_once(
    queue: &PayoutQueue,
    wallet: &dyn WalletPort,
    store: &dyn SessionSnapshotRepository,
    tracking: &dyn ActiveTracking,
    audit: &dyn AuditSink,
    notifier: &dyn PayoutNotifier,
    max_retries: u32,
) -> DrainOutcome {
    let Some(mut pending) = queue.pop_front() else {
        return DrainOutcome::Idle;
    };
    let player = pending.session.player.clone();

    if queue.is_completed(pending.session.session_id) {
        debug!(player = %player, "duplicate queue entry skipped");
        return DrainOutcome::SkippedDuplicate { player };
    }

    if pending.attempts == 0 {
        record_audit(
            audit,
            AuditEntry::new(
                AuditKind::PayoutStarted,
                pending.session.region.clone(),
                json!({
                    "player": player,
                    "amount": pending.session.total_accrued,
                    "end_reason": pending.session.end_reason,
                }),
            ),
        )
        .await;
    }

    let amount = pending.session.total_accrued;
    let memo = format!(
        "arena payout for {} ({} ledger entries)",
        pending.session.display_name,
        pending.session.ledger.len()
    );

    let attempt = async {
        let address = wallet
            .resolve_address(&player)
            .await?
            .ok_or_else(|| format!("no payout address for {player}"))?;
        wallet.transfer(&address, amount, &memo).await
    };

    match attempt.await {
        Ok(transfer_id) => {
            pending.session.status = SessionStatus::Paid;
            queue.mark_completed(pending.session.session_id);
            if let Err(err) = store
                .delete_session(&pending.session.region, &player)
                .await
            {
                // The payout went through; a stale snapshot is recovered
                // (and skipped as already-completed) on the next cycle.
                warn!(player = %player, error = %err, "snapshot delete after payout failed");
            }
            tracking.remove(&player);
            record_audit(
                audit,
                AuditEntry::new(
                    AuditKind::Payout,
                    pending.session.region.clone(),
                    json!({
                        "player": player,
                        "amount": amount,
                        "transfer_id": transfer_id,
                        "end_reason": pending.session.end_reason,
                        "ledger": pending.session.ledger,
                    }),
                ),
            )
            .await;
            if let Err(err) = notifier.payout_succeeded(&pending.session, &transfer_id).await {
                warn!(player = %player, error = %err, "payout success notification failed");
            }
            info!(player = %player, amount = %amount, transfer_id = %transfer_id, "payout settled");
            DrainOutcome::Settled {
                player,
                amount,
                transfer_id,
            }
        }
        Err(error) => {
            pending.attempts += 1;
            if pending.attempts < max_retries {
                warn!(
                    player = %player,
                    attempts = pending.attempts,
                    error = %error,
                    "payout attempt failed, requeued at front"
                );
                let attempts = pending.attempts;
                queue.requeue_front(pending);
                DrainOutcome::Retried { player, attempts }
            } else {
                pending.session.status = SessionStatus::Failed;
                tracking.remove(&player);
                record_audit(
                    audit,
                    AuditEntry::new(
                        AuditKind::PayoutFailed,
                        pending.session.region.clone(),
                        json!({
                            "player": player,
                            "amount": amount,
                            "attempts": pending.attempts,
                            "error": error,
                        }),
                    ),
                )
                .await;
                if let Err(err) = notifier.payout_failed(&pending.session, &error).await {
                    warn!(player = %player, error = %err, "payout failure alert failed");
                }
                // The snapshot record is left in the durable store on
                // purpose: the obligation stays queryable and is retried
                // after a restart-and-restore cycle.
                warn!(player = %player, amount = %amount, "payout permanently failed");
                queue.mark_failed(pending.session, error);
                DrainOutcome::FailedPermanently { player }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_payout_drain_loop(
    queue: PayoutQueue,
    wallet: Arc<dyn WalletPort>,
    store: Arc<dyn SessionSnapshotRepository>,
    tracking: Arc<dyn ActiveTracking>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn PayoutNotifier>,
    cfg: PayoutConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.drain_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("payout drain loop shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    let _ = settle_next_once(
                        &queue,
                        wallet.as_ref(),
                        store.as_ref(),
                        tracking.as_ref(),
                        audit.as_ref(),
                        notifier.as_ref(),
                        cfg.max_retries,
                    ).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use audit_log::InMemoryAuditSink;
    use payout_store::InMemoryPayoutStore;
    use session_ledger::{NoopAccrualNotifier, PayoutSink, SessionLedger};

    use arena_domain::{EndReason, RegionId, RewardReason, Session};

    use super::*;

    #[derive(Debug, Default)]
    struct NoTracking;

    impl ActiveTracking for NoTracking {
        fn remove(&self, _player: &PlayerId) {}
    }

    #[derive(Default)]
    struct CountingNotifier {
        succeeded: AtomicUsize,
        failed: AtomicUsize,
        last_transfer_id: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PayoutNotifier for CountingNotifier {
        async fn payout_succeeded(
            &self,
            _session: &Session,
            transfer_id: &str,
        ) -> Result<(), String> {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
            *self.last_transfer_id.lock().expect("lock") = Some(transfer_id.to_string());
            Ok(())
        }

        async fn payout_failed(&self, _session: &Session, _error: &str) -> Result<(), String> {
            self.failed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ended_session(player: &str, amounts: &[u64]) -> Session {
        let mut session = Session::new(
            PlayerId::from(player),
            player.to_string(),
            RegionId::from("eu-1"),
            true,
        );
        for (idx, amount) in amounts.iter().enumerate() {
            session
                .credit(
                    Amount(*amount),
                    RewardReason::Tier {
                        tier: u8::try_from(idx + 1).unwrap_or(u8::MAX),
                    },
                )
                .expect("credit");
        }
        session.status = SessionStatus::Ended;
        session.end_reason = Some(EndReason::Death);
        session
    }

    #[tokio::test]
    async fn death_cashout_scenario_settles_exactly_once() {
        // Full path through the real ledger: accrue 2.00 then 3.50, die,
        // settle with transfer id "tx123".
        let queue = PayoutQueue::new();
        let ledger = Arc::new(SessionLedger::new(
            RegionId::from("eu-1"),
            Arc::new(queue.clone()),
            Arc::new(NoopAccrualNotifier),
        ));
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();
        let audit = InMemoryAuditSink::new();
        let notifier = CountingNotifier::default();

        let player = PlayerId::from("p1");
        ledger
            .start_session(player.clone(), "Ace", true)
            .expect("start");
        ledger
            .accrue(&player, Amount(200), RewardReason::Tier { tier: 1 })
            .expect("accrue");
        ledger
            .accrue(
                &player,
                Amount(350),
                RewardReason::KillCredit {
                    victim: PlayerId::from("p2"),
                },
            )
            .expect("accrue");
        ledger.end_session(&player, EndReason::Death).expect("end");

        wallet.set_address(player.clone(), "addr-p1");
        wallet.set_next_transfer_id("tx123");

        let outcome = settle_next_once(
            &queue,
            &wallet,
            &store,
            ledger.as_ref(),
            &audit,
            &notifier,
            3,
        )
        .await;
        assert_eq!(
            outcome,
            DrainOutcome::Settled {
                player: player.clone(),
                amount: Amount(550),
                transfer_id: "tx123".to_string(),
            }
        );

        let transfers = wallet.transfers.lock().expect("lock");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].amount, Amount(550));
        assert_eq!(audit.count_of(AuditKind::Payout), 1);
        assert_eq!(audit.count_of(AuditKind::PayoutStarted), 1);
        assert_eq!(notifier.succeeded.load(Ordering::SeqCst), 1);
        assert_eq!(
            notifier.last_transfer_id.lock().expect("lock").as_deref(),
            Some("tx123")
        );
        // Terminal: gone from the active set, no more queue work.
        assert_eq!(ledger.tracked_count().expect("count"), 0);
        assert!(queue.is_empty());

        let payout_entries = audit.entries.lock().expect("lock");
        let payout = payout_entries
            .iter()
            .find(|e| e.kind == AuditKind::Payout)
            .expect("payout entry");
        assert_eq!(payout.payload["ledger"].as_array().expect("ledger").len(), 2);
    }

    #[tokio::test]
    async fn transient_failure_requeues_at_front_ahead_of_newer_sessions() {
        let queue = PayoutQueue::new();
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();
        let audit = InMemoryAuditSink::new();
        let notifier = CountingNotifier::default();

        let stuck = ended_session("stuck", &[100]);
        let fresh = ended_session("fresh", &[50]);
        wallet.set_address(stuck.player.clone(), "addr-stuck");
        wallet.set_address(fresh.player.clone(), "addr-fresh");
        queue.enqueue(stuck);
        queue.enqueue(fresh);

        wallet.fail_next(1);
        let outcome = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert_eq!(
            outcome,
            DrainOutcome::Retried {
                player: PlayerId::from("stuck"),
                attempts: 1,
            }
        );
        // The retried session is at the front, ahead of the fresh one.
        assert_eq!(
            queue.pending_players(),
            vec![PlayerId::from("stuck"), PlayerId::from("fresh")]
        );

        let outcome = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert!(matches!(outcome, DrainOutcome::Settled { player, .. } if player == PlayerId::from("stuck")));
    }

    #[tokio::test]
    async fn three_failures_with_three_max_retries_is_permanent() {
        let queue = PayoutQueue::new();
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();
        let audit = InMemoryAuditSink::new();
        let notifier = CountingNotifier::default();

        let session = ended_session("doomed", &[125]);
        wallet.set_address(session.player.clone(), "addr-doomed");
        // Keep a snapshot in the store like the backup loop would.
        store
            .replace_region_sessions(
                &session.region,
                &[payout_store::SessionSnapshotRecord {
                    session_id: session.session_id,
                    player: session.player.clone(),
                    display_name: session.display_name.clone(),
                    region: session.region.clone(),
                    is_paid: true,
                    total_accrued: session.total_accrued,
                    ledger: session.ledger.clone(),
                    status: session.status,
                    started_at: session.started_at,
                    updated_at: chrono::Utc::now(),
                }],
            )
            .await
            .expect("seed store");
        queue.enqueue(session);

        wallet.fail_next(3);
        for expected_attempts in 1..=2u32 {
            let outcome = settle_next_once(
                &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
            )
            .await;
            assert_eq!(
                outcome,
                DrainOutcome::Retried {
                    player: PlayerId::from("doomed"),
                    attempts: expected_attempts,
                }
            );
        }
        let outcome = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert_eq!(
            outcome,
            DrainOutcome::FailedPermanently {
                player: PlayerId::from("doomed"),
            }
        );

        assert_eq!(wallet.transfer_count(), 0);
        assert_eq!(notifier.failed.load(Ordering::SeqCst), 1);
        assert_eq!(audit.count_of(AuditKind::PayoutStarted), 1);
        assert_eq!(audit.count_of(AuditKind::PayoutFailed), 1);
        // Never silently dropped: visible to operators and still present
        // in the durable store for restart recovery.
        assert_eq!(queue.failed_payouts().len(), 1);
        assert_eq!(
            store
                .list_orphaned_sessions(&RegionId::from("eu-1"))
                .await
                .expect("list")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_queue_entry_settles_at_most_once() {
        let queue = PayoutQueue::new();
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();
        let audit = InMemoryAuditSink::new();
        let notifier = CountingNotifier::default();

        let session = ended_session("p1", &[300]);
        wallet.set_address(session.player.clone(), "addr-p1");
        queue.enqueue(session.clone());
        queue.enqueue(session);

        let first = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert!(matches!(first, DrainOutcome::Settled { .. }));
        let second = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert_eq!(
            second,
            DrainOutcome::SkippedDuplicate {
                player: PlayerId::from("p1"),
            }
        );
        assert_eq!(wallet.transfer_count(), 1);
    }

    #[tokio::test]
    async fn unresolvable_address_counts_as_a_retryable_failure() {
        let queue = PayoutQueue::new();
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();
        let audit = InMemoryAuditSink::new();
        let notifier = CountingNotifier::default();

        queue.enqueue(ended_session("unknown", &[10]));
        let outcome = settle_next_once(
            &queue, &wallet, &store, &NoTracking, &audit, &notifier, 3,
        )
        .await;
        assert_eq!(
            outcome,
            DrainOutcome::Retried {
                player: PlayerId::from("unknown"),
                attempts: 1,
            }
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn drain_loop_settles_and_shuts_down() {
        let queue = PayoutQueue::new();
        let wallet = InMemoryWallet::new();
        let store = InMemoryPayoutStore::new();

        let session = ended_session("p1", &[40]);
        wallet.set_address(session.player.clone(), "addr-p1");
        queue.enqueue(session);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = spawn_payout_drain_loop(
            queue.clone(),
            Arc::new(wallet.clone()),
            Arc::new(store),
            Arc::new(NoTracking),
            Arc::new(InMemoryAuditSink::new()),
            Arc::new(NoopPayoutNotifier),
            PayoutConfig {
                max_retries: 3,
                drain_interval: Duration::from_millis(10),
            },
            shutdown_rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        handle.await.expect("join");

        assert_eq!(wallet.transfer_count(), 1);
        assert!(queue.is_empty());
    }
}
