//! Append-only audit trail for every financial event.
//!
//! The local JSONL file is written first and unconditionally; it is the
//! system of record whenever the durable store is unreachable. The mirror
//! write to the durable store is best-effort and never blocks or reverses
//! the file write.

pub mod health;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use arena_domain::RegionId;
use payout_store::{AuditMirrorRecord, AuditMirrorRepository};

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("audit file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    BuyInVerified,
    BuyInRejected,
    PayoutStarted,
    Payout,
    PayoutFailed,
    FeeSplit,
    FeeSplitDeferred,
    PrizePayout,
    OrphanRecovered,
}

impl AuditKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BuyInVerified => "BUY_IN_VERIFIED",
            Self::BuyInRejected => "BUY_IN_REJECTED",
            Self::PayoutStarted => "PAYOUT_STARTED",
            Self::Payout => "PAYOUT",
            Self::PayoutFailed => "PAYOUT_FAILED",
            Self::FeeSplit => "FEE_SPLIT",
            Self::FeeSplitDeferred => "FEE_SPLIT_DEFERRED",
            Self::PrizePayout => "PRIZE_PAYOUT",
            Self::OrphanRecovered => "ORPHAN_RECOVERED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_entry_id: Uuid,
    pub kind: AuditKind,
    pub region: RegionId,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl AuditEntry {
    #[must_use]
    pub fn new(kind: AuditKind, region: RegionId, payload: Value) -> Self {
        Self {
            audit_entry_id: Uuid::now_v7(),
            kind,
            region,
            at: Utc::now(),
            payload,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _entry: AuditEntry) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAuditSink {
    pub entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count_of(&self, kind: AuditKind) -> usize {
        self.entries
            .lock()
            .map(|guard| guard.iter().filter(|e| e.kind == kind).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<AuditKind> {
        self.entries
            .lock()
            .map(|guard| guard.iter().map(|e| e.kind).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), String> {
        self.entries
            .lock()
            .map_err(|_| "audit entries lock poisoned".to_string())?
            .push(entry);
        Ok(())
    }
}

/// File-backed audit log with an optional durable-store mirror.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    mirror: Option<Arc<dyn AuditMirrorRepository>>,
    file_gate: Arc<tokio::sync::Mutex<()>>,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mirror: None,
            file_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn AuditMirrorRepository>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_line(&self, entry: &AuditEntry) -> Result<(), AuditLogError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| AuditLogError::Serialization(e.to_string()))?;
        let _gate = self.file_gate.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), String> {
        // File first, unconditionally. Only a file failure is an error.
        self.append_line(&entry).await.map_err(|e| e.to_string())?;

        if let Some(mirror) = self.mirror.clone() {
            let record = AuditMirrorRecord {
                audit_entry_id: entry.audit_entry_id,
                kind: entry.kind.as_str().to_string(),
                region: entry.region.clone(),
                at: entry.at,
                payload: entry.payload.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = mirror.insert_audit_entry(&record).await {
                    warn!(error = %err, kind = %record.kind, "audit mirror write failed");
                }
            });
        }
        Ok(())
    }
}

/// Copies the audit log to a dated backup file, skipping when that day's
/// backup already exists.
pub async fn run_audit_backup_once(
    log_path: &Path,
    backup_dir: &Path,
    date: NaiveDate,
) -> Result<bool, AuditLogError> {
    if !log_path.exists() {
        return Ok(false);
    }
    tokio::fs::create_dir_all(backup_dir).await?;
    let target = backup_dir.join(format!("audit-{}.jsonl", date.format("%Y-%m-%d")));
    if target.exists() {
        return Ok(false);
    }
    tokio::fs::copy(log_path, &target).await?;
    info!(target = %target.display(), "audit log backup written");
    Ok(true)
}

pub fn spawn_audit_backup_loop(
    log_path: PathBuf,
    backup_dir: PathBuf,
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
                    if let Err(err) =
                        run_audit_backup_once(&log_path, &backup_dir, Utc::now().date_naive()).await
                    {
                        warn!(error = %err, "audit backup iteration failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use payout_store::{InMemoryPayoutStore, StoreError};
    use serde_json::json;

    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("audit-log-{tag}-{}.jsonl", Uuid::now_v7()))
    }

    #[tokio::test]
    async fn appends_one_parseable_json_line_per_entry() {
        let path = temp_path("lines");
        let log = AuditLog::new(&path);
        let region = RegionId::from("eu-1");
        log.record(AuditEntry::new(
            AuditKind::Payout,
            region.clone(),
            json!({"player": "p1", "amount": 550}),
        ))
        .await
        .expect("record");
        log.record(AuditEntry::new(
            AuditKind::PayoutFailed,
            region,
            json!({"player": "p2"}),
        ))
        .await
        .expect("record");

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).expect("parse");
        assert_eq!(first.kind, AuditKind::Payout);
        assert_eq!(first.payload["amount"], json!(550));
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[derive(Debug, Default)]
    struct FailingMirror {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AuditMirrorRepository for FailingMirror {
        async fn insert_audit_entry(&self, _record: &AuditMirrorRecord) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database("store unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn mirror_failure_never_blocks_the_file_write() {
        let path = temp_path("mirror-fail");
        let mirror = Arc::new(FailingMirror::default());
        let log = AuditLog::new(&path).with_mirror(mirror.clone());
        log.record(AuditEntry::new(
            AuditKind::BuyInVerified,
            RegionId::from("eu-1"),
            json!({"signature": "sig-1"}),
        ))
        .await
        .expect("record succeeds despite mirror failure");

        let content = tokio::fs::read_to_string(&path).await.expect("read");
        assert_eq!(content.lines().count(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mirror.attempts.load(Ordering::SeqCst), 1);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn mirror_receives_entries_when_store_is_up() {
        let path = temp_path("mirror-ok");
        let store = Arc::new(InMemoryPayoutStore::new());
        let log = AuditLog::new(&path).with_mirror(store.clone());
        log.record(AuditEntry::new(
            AuditKind::FeeSplit,
            RegionId::from("eu-1"),
            json!({"creator_share": 40}),
        ))
        .await
        .expect("record");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let mirrored = store.audit_entries.lock().expect("lock");
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].kind, "FEE_SPLIT");
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn daily_backup_is_idempotent_per_date() {
        let path = temp_path("backup-src");
        let backup_dir = std::env::temp_dir().join(format!("audit-backups-{}", Uuid::now_v7()));
        let log = AuditLog::new(&path);
        log.record(AuditEntry::new(
            AuditKind::Payout,
            RegionId::from("eu-1"),
            json!({}),
        ))
        .await
        .expect("record");

        let date = NaiveDate::from_ymd_opt(2026, 8, 7).expect("date");
        assert!(run_audit_backup_once(&path, &backup_dir, date)
            .await
            .expect("first"));
        assert!(!run_audit_backup_once(&path, &backup_dir, date)
            .await
            .expect("second"));
        assert!(backup_dir.join("audit-2026-08-07.jsonl").exists());

        let _ = tokio::fs::remove_file(&path).await;
        let _ = tokio::fs::remove_dir_all(&backup_dir).await;
    }
}
