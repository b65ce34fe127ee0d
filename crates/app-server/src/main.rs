use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::oneshot;
use tracing::{info, warn};

use app_server::config::AppConfig;
use app_server::{GameEvents, HttpWalletService, JsonRpcChainClient, WebhookNotifier};

use arena_domain::{Amount, RegionId, RewardReason, Session};
use audit_log::health::{HealthWatcher, spawn_health_watch_loop};
use audit_log::{spawn_audit_backup_loop, AuditLog, AuditSink};
use fee_splitter::{spawn_fee_split_loop, FeeConfig, FeeSplitter};
use observability::init_tracing;
use payout_pipeline::{spawn_payout_drain_loop, PayoutConfig, PayoutQueue};
use payout_store::{
    AuditMirrorRepository, InMemoryPayoutStore, PendingFeesRepository, PostgresPayoutStore,
    SessionSnapshotRepository, SignatureRepository,
};
use replay_guard::{spawn_signature_prune_loop, ReplayGuard, ReplayGuardConfig};
use session_ledger::{AccrualNotifier, SessionLedger};
use state_backup::{spawn_snapshot_loop, BackupConfig, StateBackup};

struct StoreHandles {
    sessions: Arc<dyn SessionSnapshotRepository>,
    fees: Arc<dyn PendingFeesRepository>,
    signatures: Arc<dyn SignatureRepository>,
    audit_mirror: Arc<dyn AuditMirrorRepository>,
}

async fn connect_store(cfg: &AppConfig) -> Result<StoreHandles> {
    match &cfg.database.url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(8)
                .connect(url)
                .await?;
            let store = Arc::new(PostgresPayoutStore::new(pool));
            info!("durable store: postgres");
            Ok(StoreHandles {
                sessions: store.clone(),
                fees: store.clone(),
                signatures: store.clone(),
                audit_mirror: store,
            })
        }
        None => {
            warn!("no database configured, durable state is process-local only");
            let store = Arc::new(InMemoryPayoutStore::new());
            Ok(StoreHandles {
                sessions: store.clone(),
                fees: store.clone(),
                signatures: store.clone(),
                audit_mirror: store,
            })
        }
    }
}

/// Surfaces the running total back toward the UI layer; the transport is
/// owned by the game simulation, this side only logs it.
struct LogAccrualNotifier;

impl AccrualNotifier for LogAccrualNotifier {
    fn accrual_update(&self, session: &Session, credited: Amount, reason: &RewardReason) {
        info!(
            player = %session.player,
            credited = %credited,
            total = %session.total_accrued,
            reason = reason.label(),
            "running total updated"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load()?;
    init_tracing(&cfg.app.service_name, &cfg.observability.log_filter);
    let region = RegionId::from(cfg.app.region.as_str());
    info!(region = %region, env = cfg.app.env.as_str(), "starting");

    let stores = connect_store(&cfg).await?;
    let audit: Arc<dyn AuditSink> = Arc::new(
        AuditLog::new(&cfg.audit.log_path).with_mirror(stores.audit_mirror.clone()),
    );
    let webhook = Arc::new(WebhookNotifier::new(cfg.webhook.url.clone(), region.clone()));
    let wallet = Arc::new(HttpWalletService::new(&cfg.wallet));
    let chain = Arc::new(JsonRpcChainClient::new(cfg.chain.rpc_endpoint.clone()));

    let queue = PayoutQueue::new();
    let ledger = Arc::new(SessionLedger::new(
        region.clone(),
        Arc::new(queue.clone()),
        Arc::new(LogAccrualNotifier),
    ));
    let splitter = FeeSplitter::new(
        region.clone(),
        FeeConfig {
            buy_in: Amount(cfg.fees.buy_in),
            creator_share_bps: cfg.fees.creator_share_bps,
            prize_share_bps: cfg.fees.prize_share_bps,
            creator_address: cfg.fees.creator_address.clone(),
            split_interval: Duration::from_secs(cfg.fees.split_interval_secs),
        },
    );
    let guard = ReplayGuard::new(
        region.clone(),
        ReplayGuardConfig {
            house_account: cfg.chain.house_account.clone(),
            max_transaction_age: chrono::Duration::seconds(
                i64::try_from(cfg.chain.max_transaction_age_secs).unwrap_or(86_400),
            ),
            purpose: "buy_in".to_string(),
        },
        chain,
        wallet.clone(),
        stores.signatures.clone(),
        audit.clone(),
    );

    let backup = StateBackup::new(
        region.clone(),
        BackupConfig {
            snapshot_path: cfg.backup.snapshot_path.clone().into(),
            snapshot_interval: Duration::from_secs(cfg.backup.snapshot_interval_secs),
            max_snapshot_age: chrono::Duration::seconds(
                i64::try_from(cfg.backup.max_snapshot_age_secs).unwrap_or(600),
            ),
        },
        ledger.clone(),
        splitter.clone(),
        stores.sessions.clone(),
        stores.fees.clone(),
        audit.clone(),
    );

    // Recover obligations a previous process left behind before any new
    // game events are accepted.
    let restore_report = backup.restore(&queue).await?;
    info!(
        recovered = restore_report.recovered,
        fees_restored = restore_report.fees_restored,
        from_local_snapshot = restore_report.from_local_snapshot,
        "restore complete"
    );

    let game_events = GameEvents::new(
        ledger.clone(),
        splitter.clone(),
        guard.clone(),
        Amount(cfg.fees.buy_in),
    );
    if cfg.app.env == app_server::AppEnv::Local {
        // Smoke the event surface the way the simulation layer will use it.
        let demo_player = arena_domain::PlayerId::from("demo-player");
        let _ = game_events.free_spawn(demo_player.clone(), "Demo");
        let _ = game_events.player_disconnect(&demo_player);
        info!("local demo game events executed");
    }

    let (drain_tx, drain_rx) = oneshot::channel();
    let drain_handle = spawn_payout_drain_loop(
        queue.clone(),
        wallet.clone(),
        stores.sessions.clone(),
        ledger.clone(),
        audit.clone(),
        webhook.clone(),
        PayoutConfig {
            max_retries: cfg.payout.max_retries,
            drain_interval: Duration::from_secs(cfg.payout.drain_interval_secs),
        },
        drain_rx,
    );

    let (snapshot_tx, snapshot_rx) = oneshot::channel();
    let snapshot_handle = spawn_snapshot_loop(backup, snapshot_rx);

    let (fee_tx, fee_rx) = oneshot::channel();
    let fee_handle = spawn_fee_split_loop(
        splitter,
        wallet.clone(),
        stores.fees.clone(),
        audit.clone(),
        fee_rx,
    );

    let (health_tx, health_rx) = oneshot::channel();
    let health_handle = spawn_health_watch_loop(
        HealthWatcher::new(wallet.clone(), webhook.clone()),
        Duration::from_secs(cfg.audit.health_probe_interval_secs),
        health_rx,
    );

    let (prune_tx, prune_rx) = oneshot::channel();
    let prune_handle = spawn_signature_prune_loop(
        guard,
        Duration::from_secs(cfg.chain.max_transaction_age_secs),
        prune_rx,
    );

    let (audit_backup_tx, audit_backup_rx) = oneshot::channel();
    let audit_backup_handle = spawn_audit_backup_loop(
        cfg.audit.log_path.clone().into(),
        cfg.audit.backup_dir.clone().into(),
        Duration::from_secs(cfg.audit.backup_interval_secs),
        audit_backup_rx,
    );

    info!("payout pipeline running, game-event interface ready");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    for tx in [
        drain_tx,
        snapshot_tx,
        fee_tx,
        health_tx,
        prune_tx,
        audit_backup_tx,
    ] {
        let _ = tx.send(());
    }
    for handle in [
        drain_handle,
        snapshot_handle,
        fee_handle,
        health_handle,
        prune_handle,
        audit_backup_handle,
    ] {
        let _ = handle.await;
    }
    info!("shutdown complete");
    Ok(())
}
