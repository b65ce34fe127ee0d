//! Anti-replay verification of inbound buy-in claims.
//!
//! A claim asserts "this blockchain transaction already paid amount X into
//! the house account". The durable store is the authoritative signature
//! pool shared by every region; the in-process cache is only a fast path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

use arena_domain::{Amount, PlayerId, RegionId};
use audit_log::{AuditEntry, AuditKind, AuditSink};
use payout_store::{SignatureRepository, StoreError, VerifiedSignatureRecord};

#[derive(Debug, Error)]
pub enum ReplayGuardError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("chain query error: {0}")]
    Chain(String),
    #[error("address resolution error: {0}")]
    Resolver(String),
    #[error("signature cache lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyUsed,
    NotFound,
    FailedOnChain,
    TooOld,
    WrongSigner,
    AmountMismatch,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyUsed => "already used",
            Self::NotFound => "not found",
            Self::FailedOnChain => "failed on-chain",
            Self::TooOld => "too old",
            Self::WrongSigner => "wrong signer",
            Self::AmountMismatch => "amount mismatch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimVerdict {
    Verified,
    Rejected(RejectReason),
}

impl ClaimVerdict {
    #[must_use]
    pub fn is_verified(self) -> bool {
        self == Self::Verified
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuyInClaim {
    pub signature: String,
    pub player: PlayerId,
    pub expected_amount: Amount,
}

/// A finalized transaction as reported by the blockchain query layer.
/// `balance_deltas` maps account to net change of the expected asset, in
/// the same smallest unit as [`Amount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub signature: String,
    pub block_time: DateTime<Utc>,
    pub success: bool,
    pub signers: Vec<String>,
    pub balance_deltas: HashMap<String, i128>,
}

#[async_trait]
pub trait ChainQueryPort: Send + Sync {
    /// Fetches a finalized transaction; `None` when the signature is not
    /// yet found or not final.
    async fn transaction_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ChainTransaction>, String>;
}

/// Resolves a player's own wallet address, used for the signer check.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve_address(&self, player: &PlayerId) -> Result<Option<String>, String>;
}

#[derive(Debug, Clone)]
pub struct ReplayGuardConfig {
    pub house_account: String,
    /// Transactions older than this are rejected outright; it also bounds
    /// how long signature records must be retained.
    pub max_transaction_age: chrono::Duration,
    pub purpose: String,
}

impl Default for ReplayGuardConfig {
    fn default() -> Self {
        Self {
            house_account: String::new(),
            max_transaction_age: chrono::Duration::hours(24),
            purpose: "buy_in".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ReplayGuard {
    region: RegionId,
    cfg: ReplayGuardConfig,
    chain: Arc<dyn ChainQueryPort>,
    resolver: Arc<dyn AddressResolver>,
    store: Arc<dyn SignatureRepository>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<Mutex<HashSet<String>>>,
}

impl ReplayGuard {
    #[must_use]
    pub fn new(
        region: RegionId,
        cfg: ReplayGuardConfig,
        chain: Arc<dyn ChainQueryPort>,
        resolver: Arc<dyn AddressResolver>,
        store: Arc<dyn SignatureRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            region,
            cfg,
            chain,
            resolver,
            store,
            audit,
            cache: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs the ordered claim checks. Only a fully verified claim records
    /// the signature; every outcome is audited.
    pub async fn verify_claim(
        &self,
        claim: &BuyInClaim,
    ) -> Result<ClaimVerdict, ReplayGuardError> {
        let verdict = self.check_claim(claim).await?;
        match verdict {
            ClaimVerdict::Verified => {
                info!(signature = %claim.signature, player = %claim.player, "buy-in verified");
                self.audit(AuditEntry::new(
                    AuditKind::BuyInVerified,
                    self.region.clone(),
                    json!({
                        "signature": claim.signature,
                        "player": claim.player,
                        "amount": claim.expected_amount,
                    }),
                ))
                .await;
            }
            ClaimVerdict::Rejected(reason) => {
                warn!(
                    signature = %claim.signature,
                    player = %claim.player,
                    reason = reason.as_str(),
                    "buy-in claim rejected"
                );
                self.audit(AuditEntry::new(
                    AuditKind::BuyInRejected,
                    self.region.clone(),
                    json!({
                        "signature": claim.signature,
                        "player": claim.player,
                        "reason": reason,
                    }),
                ))
                .await;
            }
        }
        Ok(verdict)
    }

    async fn check_claim(&self, claim: &BuyInClaim) -> Result<ClaimVerdict, ReplayGuardError> {
        // 1. Replay: cache fast path, then the shared store. The store is
        // authoritative because other regions write to it too.
        let cached = self
            .cache
            .lock()
            .map_err(|_| ReplayGuardError::LockPoisoned)?
            .contains(&claim.signature);
        if cached || self.store.signature_exists(&claim.signature).await? {
            return Ok(ClaimVerdict::Rejected(RejectReason::AlreadyUsed));
        }

        // 2. Finalized on-chain at all.
        let Some(tx) = self
            .chain
            .transaction_by_signature(&claim.signature)
            .await
            .map_err(ReplayGuardError::Chain)?
        else {
            return Ok(ClaimVerdict::Rejected(RejectReason::NotFound));
        };

        // 3. Executed successfully.
        if !tx.success {
            return Ok(ClaimVerdict::Rejected(RejectReason::FailedOnChain));
        }

        // 4. Within the replay window.
        if Utc::now() - tx.block_time > self.cfg.max_transaction_age {
            return Ok(ClaimVerdict::Rejected(RejectReason::TooOld));
        }

        // 5. Signed by the claimed player's own wallet. An unresolvable
        // wallet cannot prove ownership.
        let address = self
            .resolver
            .resolve_address(&claim.player)
            .await
            .map_err(ReplayGuardError::Resolver)?;
        let Some(address) = address else {
            return Ok(ClaimVerdict::Rejected(RejectReason::WrongSigner));
        };
        if !tx.signers.iter().any(|signer| signer == &address) {
            return Ok(ClaimVerdict::Rejected(RejectReason::WrongSigner));
        }

        // 6. The house account actually gained the expected amount.
        let delta = tx
            .balance_deltas
            .get(&self.cfg.house_account)
            .copied()
            .unwrap_or(0);
        if delta < i128::from(claim.expected_amount.as_u64()) {
            return Ok(ClaimVerdict::Rejected(RejectReason::AmountMismatch));
        }

        // All checks passed: claim the signature. Losing the store race to
        // another region counts as a replay.
        let recorded = self
            .store
            .record_signature(&VerifiedSignatureRecord {
                signature: claim.signature.clone(),
                payer: claim.player.clone(),
                amount: claim.expected_amount,
                purpose: self.cfg.purpose.clone(),
                created_at: Utc::now(),
            })
            .await?;
        if !recorded {
            return Ok(ClaimVerdict::Rejected(RejectReason::AlreadyUsed));
        }
        self.cache
            .lock()
            .map_err(|_| ReplayGuardError::LockPoisoned)?
            .insert(claim.signature.clone());
        Ok(ClaimVerdict::Verified)
    }

    /// Drops signature records past the replay window; on-chain history
    /// covers anything older. The cache is cleared wholesale, the next
    /// misses fall through to the store.
    pub async fn prune_expired(&self) -> Result<usize, ReplayGuardError> {
        let cutoff = Utc::now() - self.cfg.max_transaction_age;
        let dropped = self.store.delete_signatures_before(cutoff).await?;
        self.cache
            .lock()
            .map_err(|_| ReplayGuardError::LockPoisoned)?
            .clear();
        if dropped > 0 {
            info!(dropped, "expired signature records pruned");
        }
        Ok(dropped)
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(err) = self.audit.record(entry).await {
            warn!(error = %err, "audit record failed");
        }
    }
}

pub fn spawn_signature_prune_loop(
    guard: ReplayGuard,
    poll_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = guard.prune_expired().await {
                        warn!(error = %err, "signature prune iteration failed");
                    }
                }
            }
        }
    })
}
