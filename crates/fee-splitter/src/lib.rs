//! Periodic disbursement of the non-house shares of verified buy-ins.
//!
//! Retry here is coarser than the payout queue on purpose: a failed
//! disbursement simply stays pending and is retried on the next interval,
//! since delay has no player-visible impact. The prize retries by the
//! amount carried in pending state, never by re-deriving a past
//! leaderboard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use arena_domain::{Amount, MoneyError, PlayerId, RegionId};
use audit_log::{AuditEntry, AuditKind, AuditSink};
use payout_pipeline::WalletPort;
use payout_store::{PendingFeesRecord, PendingFeesRepository};

#[derive(Debug, Error)]
pub enum FeeError {
    #[error("fee state lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Money(#[from] MoneyError),
}

#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Fixed entry fee every paid session starts with.
    pub buy_in: Amount,
    pub creator_share_bps: u16,
    pub prize_share_bps: u16,
    pub creator_address: String,
    pub split_interval: Duration,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            buy_in: Amount(1_000),
            creator_share_bps: 250,
            prize_share_bps: 250,
            creator_address: String::new(),
            split_interval: Duration::from_secs(3_600),
        }
    }
}

#[derive(Debug, Default)]
struct FeeState {
    creator_share: Amount,
    prize_pool: Amount,
    interval_volume: Amount,
    interval_kills: HashMap<PlayerId, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeeSplitOutcome {
    pub creator_paid: Option<Amount>,
    pub creator_deferred: Option<Amount>,
    pub prize_paid: Option<(PlayerId, Amount)>,
    pub prize_rolled_over: bool,
}

#[derive(Clone)]
pub struct FeeSplitter {
    region: RegionId,
    cfg: FeeConfig,
    state: Arc<Mutex<FeeState>>,
}

impl FeeSplitter {
    #[must_use]
    pub fn new(region: RegionId, cfg: FeeConfig) -> Self {
        Self {
            region,
            cfg,
            state: Arc::new(Mutex::new(FeeState::default())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &FeeConfig {
        &self.cfg
    }

    /// Accumulates the creator and prize shares of one verified buy-in and
    /// counts it toward the interval's play volume.
    pub fn record_buy_in(&self, player: &PlayerId) -> Result<(), FeeError> {
        let creator_cut = self.cfg.buy_in.share_bps(self.cfg.creator_share_bps)?;
        let prize_cut = self.cfg.buy_in.share_bps(self.cfg.prize_share_bps)?;
        let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
        state.creator_share = state.creator_share.checked_add(creator_cut)?;
        state.prize_pool = state.prize_pool.checked_add(prize_cut)?;
        state.interval_volume = state.interval_volume.checked_add(self.cfg.buy_in)?;
        debug!(player = %player, "buy-in fees accumulated");
        Ok(())
    }

    pub fn record_kill(&self, killer: &PlayerId) -> Result<u32, FeeError> {
        let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
        let count = state.interval_kills.entry(killer.clone()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    #[must_use]
    pub fn pending_snapshot(&self) -> PendingFeesRecord {
        let (creator_share, prize_pool) = self
            .state
            .lock()
            .map(|state| (state.creator_share, state.prize_pool))
            .unwrap_or((Amount::ZERO, Amount::ZERO));
        PendingFeesRecord {
            region: self.region.clone(),
            creator_share,
            prize_pool,
            updated_at: Utc::now(),
        }
    }

    /// Seeds pending amounts from a persisted record, used at restore.
    pub fn restore_pending(&self, record: &PendingFeesRecord) -> Result<(), FeeError> {
        let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
        state.creator_share = record.creator_share;
        state.prize_pool = record.prize_pool;
        info!(
            creator_share = %record.creator_share,
            prize_pool = %record.prize_pool,
            "pending fees restored"
        );
        Ok(())
    }

    /// One disbursement cycle: creator share, then the interval prize.
    /// Kill counters and volume reset win or lose; pending amounts only
    /// shrink when a transfer actually succeeded.
    pub async fn run_fee_split_once(
        &self,
        wallet: &dyn WalletPort,
        store: &dyn PendingFeesRepository,
        audit: &dyn AuditSink,
    ) -> Result<FeeSplitOutcome, FeeError> {
        let (creator_due, prize_due, interval_volume, leader) = {
            let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
            // Ties break toward the lexicographically smaller player id so
            // the winner is deterministic.
            let leader = state
                .interval_kills
                .iter()
                .map(|(player, kills)| (player.clone(), *kills))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)));
            let interval_volume = state.interval_volume;
            state.interval_kills.clear();
            state.interval_volume = Amount::ZERO;
            (state.creator_share, state.prize_pool, interval_volume, leader)
        };

        let mut outcome = FeeSplitOutcome::default();

        if !creator_due.is_zero() {
            match wallet
                .transfer(&self.cfg.creator_address, creator_due, "creator fee share")
                .await
            {
                Ok(transfer_id) => {
                    self.debit_creator(creator_due)?;
                    info!(amount = %creator_due, transfer_id = %transfer_id, "creator share disbursed");
                    self.audit(
                        audit,
                        AuditEntry::new(
                            AuditKind::FeeSplit,
                            self.region.clone(),
                            json!({
                                "amount": creator_due,
                                "transfer_id": transfer_id,
                            }),
                        ),
                    )
                    .await;
                    outcome.creator_paid = Some(creator_due);
                }
                Err(error) => {
                    warn!(amount = %creator_due, error = %error, "creator share deferred");
                    self.audit(
                        audit,
                        AuditEntry::new(
                            AuditKind::FeeSplitDeferred,
                            self.region.clone(),
                            json!({
                                "amount": creator_due,
                                "error": error,
                            }),
                        ),
                    )
                    .await;
                    outcome.creator_deferred = Some(creator_due);
                }
            }
        }

        if !prize_due.is_zero() {
            outcome = self
                .disburse_prize(wallet, audit, outcome, prize_due, interval_volume, leader)
                .await?;
        }

        let record = self.pending_snapshot();
        if let Err(err) = store.upsert_pending_fees(&record).await {
            // Process memory still holds the amounts; the store catches up
            // on the next cycle or snapshot.
            warn!(error = %err, "pending fees persist failed");
        }
        Ok(outcome)
    }

    async fn disburse_prize(
        &self,
        wallet: &dyn WalletPort,
        audit: &dyn AuditSink,
        mut outcome: FeeSplitOutcome,
        prize_due: Amount,
        interval_volume: Amount,
        leader: Option<(PlayerId, u32)>,
    ) -> Result<FeeSplitOutcome, FeeError> {
        let rolled = |outcome: &mut FeeSplitOutcome| {
            outcome.prize_rolled_over = true;
        };

        if interval_volume.is_zero() {
            debug!("no play volume this interval, prize pool rolls over");
            rolled(&mut outcome);
            return Ok(outcome);
        }
        let Some((leader, kills)) = leader else {
            debug!("no kill leader this interval, prize pool rolls over");
            rolled(&mut outcome);
            return Ok(outcome);
        };
        let address = match wallet.resolve_address(&leader).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                warn!(player = %leader, "prize leader has no payout address, prize rolls over");
                rolled(&mut outcome);
                return Ok(outcome);
            }
            Err(error) => {
                warn!(player = %leader, error = %error, "prize leader resolution failed, prize rolls over");
                rolled(&mut outcome);
                return Ok(outcome);
            }
        };

        match wallet
            .transfer(&address, prize_due, "interval kill-leader prize")
            .await
        {
            Ok(transfer_id) => {
                self.debit_prize(prize_due)?;
                info!(player = %leader, amount = %prize_due, transfer_id = %transfer_id, "prize disbursed");
                self.audit(
                    audit,
                    AuditEntry::new(
                        AuditKind::PrizePayout,
                        self.region.clone(),
                        json!({
                            "player": leader,
                            "amount": prize_due,
                            "interval_kills": kills,
                            "transfer_id": transfer_id,
                        }),
                    ),
                )
                .await;
                outcome.prize_paid = Some((leader, prize_due));
            }
            Err(error) => {
                warn!(player = %leader, amount = %prize_due, error = %error, "prize transfer failed, prize rolls over");
                rolled(&mut outcome);
            }
        }
        Ok(outcome)
    }

    fn debit_creator(&self, amount: Amount) -> Result<(), FeeError> {
        let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
        state.creator_share = state.creator_share.checked_sub(amount)?;
        Ok(())
    }

    fn debit_prize(&self, amount: Amount) -> Result<(), FeeError> {
        let mut state = self.state.lock().map_err(|_| FeeError::LockPoisoned)?;
        state.prize_pool = state.prize_pool.checked_sub(amount)?;
        Ok(())
    }

    async fn audit(&self, audit: &dyn AuditSink, entry: AuditEntry) {
        if let Err(err) = audit.record(entry).await {
            warn!(error = %err, "audit record failed");
        }
    }
}

pub fn spawn_fee_split_loop(
    splitter: FeeSplitter,
    wallet: Arc<dyn WalletPort>,
    store: Arc<dyn PendingFeesRepository>,
    audit: Arc<dyn AuditSink>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(splitter.cfg.split_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("fee split loop shutdown");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = splitter
                        .run_fee_split_once(wallet.as_ref(), store.as_ref(), audit.as_ref())
                        .await
                    {
                        warn!(error = %err, "fee split iteration failed");
                    }
                }
            }
        }
    })
}
