use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use arena_domain::{Amount, PlayerId, RegionId, SessionId, SessionStatus};

use crate::records::{
    AuditMirrorRecord, PendingFeesRecord, SessionSnapshotRecord, VerifiedSignatureRecord,
};
use crate::{
    AuditMirrorRepository, PendingFeesRepository, SessionSnapshotRepository, SignatureRepository,
    StoreError,
};

#[derive(Debug, Clone)]
pub struct PostgresPayoutStore {
    pool: PgPool,
}

impl PostgresPayoutStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn amount_to_i64(amount: Amount) -> i64 {
    i64::try_from(amount.as_u64()).unwrap_or(i64::MAX)
}

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Ended => "ended",
        SessionStatus::Paid => "paid",
        SessionStatus::Failed => "failed",
    }
}

fn status_from_str(value: &str) -> SessionStatus {
    match value {
        "ended" => SessionStatus::Ended,
        "paid" => SessionStatus::Paid,
        "failed" => SessionStatus::Failed,
        _ => SessionStatus::Active,
    }
}

fn row_to_session_snapshot(
    row: &sqlx::postgres::PgRow,
) -> Result<SessionSnapshotRecord, StoreError> {
    let ledger_json: Value = row.try_get("ledger_json").map_err(db_err)?;
    let ledger = serde_json::from_value(ledger_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(SessionSnapshotRecord {
        session_id: SessionId(row.try_get::<Uuid, _>("session_id").map_err(db_err)?),
        player: PlayerId(row.try_get("player").map_err(db_err)?),
        display_name: row.try_get("display_name").map_err(db_err)?,
        region: RegionId(row.try_get("region").map_err(db_err)?),
        is_paid: row.try_get("is_paid").map_err(db_err)?,
        total_accrued: Amount(
            u64::try_from(row.try_get::<i64, _>("total_accrued").map_err(db_err)?)
                .unwrap_or_default(),
        ),
        ledger,
        status: status_from_str(&status),
        started_at: row.try_get("started_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[async_trait]
impl SessionSnapshotRepository for PostgresPayoutStore {
    async fn replace_region_sessions(
        &self,
        region: &RegionId,
        records: &[SessionSnapshotRecord],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM session_snapshots WHERE region = $1")
            .bind(&region.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for record in records {
            let ledger_json = serde_json::to_value(&record.ledger)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO session_snapshots (
                    session_id, player, display_name, region, is_paid,
                    total_accrued, ledger_json, status, started_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (region, player) DO UPDATE SET
                    session_id = EXCLUDED.session_id,
                    display_name = EXCLUDED.display_name,
                    is_paid = EXCLUDED.is_paid,
                    total_accrued = EXCLUDED.total_accrued,
                    ledger_json = EXCLUDED.ledger_json,
                    status = EXCLUDED.status,
                    started_at = EXCLUDED.started_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(record.session_id.0)
            .bind(&record.player.0)
            .bind(&record.display_name)
            .bind(&record.region.0)
            .bind(record.is_paid)
            .bind(amount_to_i64(record.total_accrued))
            .bind(ledger_json)
            .bind(status_to_str(record.status))
            .bind(record.started_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn delete_session(
        &self,
        region: &RegionId,
        player: &PlayerId,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_snapshots WHERE region = $1 AND player = $2")
            .bind(&region.0)
            .bind(&player.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_orphaned_sessions(
        &self,
        region: &RegionId,
    ) -> Result<Vec<SessionSnapshotRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, player, display_name, region, is_paid,
                   total_accrued, ledger_json, status, started_at, updated_at
            FROM session_snapshots
            WHERE region = $1 AND is_paid = TRUE AND total_accrued > 0
            ORDER BY updated_at ASC
            "#,
        )
        .bind(&region.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_session_snapshot).collect()
    }
}

#[async_trait]
impl PendingFeesRepository for PostgresPayoutStore {
    async fn upsert_pending_fees(&self, record: &PendingFeesRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_fees (region, creator_share, prize_pool, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (region) DO UPDATE SET
                creator_share = EXCLUDED.creator_share,
                prize_pool = EXCLUDED.prize_pool,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.region.0)
        .bind(amount_to_i64(record.creator_share))
        .bind(amount_to_i64(record.prize_pool))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_pending_fees(
        &self,
        region: &RegionId,
    ) -> Result<Option<PendingFeesRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT region, creator_share, prize_pool, updated_at FROM pending_fees WHERE region = $1",
        )
        .bind(&region.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| {
            Ok(PendingFeesRecord {
                region: RegionId(row.try_get("region").map_err(db_err)?),
                creator_share: Amount(
                    u64::try_from(row.try_get::<i64, _>("creator_share").map_err(db_err)?)
                        .unwrap_or_default(),
                ),
                prize_pool: Amount(
                    u64::try_from(row.try_get::<i64, _>("prize_pool").map_err(db_err)?)
                        .unwrap_or_default(),
                ),
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SignatureRepository for PostgresPayoutStore {
    async fn signature_exists(&self, signature: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM verified_signatures WHERE signature = $1")
            .bind(signature)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn record_signature(
        &self,
        record: &VerifiedSignatureRecord,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO verified_signatures (signature, payer, amount, purpose, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (signature) DO NOTHING
            "#,
        )
        .bind(&record.signature)
        .bind(&record.payer.0)
        .bind(amount_to_i64(record.amount))
        .bind(&record.purpose)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_signatures_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM verified_signatures WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }
}

#[async_trait]
impl AuditMirrorRepository for PostgresPayoutStore {
    async fn insert_audit_entry(&self, record: &AuditMirrorRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (audit_entry_id, kind, region, occurred_at, payload_json)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (audit_entry_id) DO NOTHING
            "#,
        )
        .bind(record.audit_entry_id)
        .bind(&record.kind)
        .bind(&record.region.0)
        .bind(record.at)
        .bind(&record.payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
