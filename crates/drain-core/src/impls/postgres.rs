//! PostgreSQL outbox store (sqlx).
//!
//! The claim is one statement: a CTE that locks due pending rows with
//! `FOR UPDATE SKIP LOCKED`, then flips them to `processing`. A row locked
//! by another claimer is invisible to this one, not merely delayed, which
//! is what lets several drain instances share the table safely.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{error, warn};

use crate::domain::{
    ClaimToken, EventType, OutboxCounts, OutboxId, OutboxRecord, OutboxStatus, truncate_error,
};
use crate::error::StoreError;
use crate::ports::OutboxStore;

/// Reference DDL for the outbox table.
pub const SCHEMA_SQL: &str = include_str!("../../migrations/0001_incident_outbox.sql");

// Postgres intervals top out far below Duration::MAX.
const MAX_DELAY_SECS: f64 = 100.0 * 365.25 * 24.0 * 3600.0;

const CLAIM_SQL: &str = r#"
    WITH cte AS (
        SELECT id
        FROM incident_outbox
        WHERE status = 'pending'
          AND available_at <= now()
        ORDER BY id
        FOR UPDATE SKIP LOCKED
        LIMIT $1
    )
    UPDATE incident_outbox o
    SET status = 'processing',
        available_at = now()
    FROM cte
    WHERE o.id = cte.id
    RETURNING o.id, o.event_type, o.payload, o.status, o.attempts,
              o.available_at, o.last_error, o.created_at
"#;

const RESCHEDULE_SQL: &str = r#"
    UPDATE incident_outbox
       SET status = 'pending',
           attempts = attempts + 1,
           available_at = now() + make_interval(secs => $2),
           last_error = $3
     WHERE id = $1
       AND status = 'processing'
       AND available_at = $4
"#;

const MARK_DEAD_SQL: &str = r#"
    UPDATE incident_outbox
       SET status = 'dead',
           last_error = $2
     WHERE id = $1
       AND status = 'processing'
       AND available_at = $3
"#;

const DELETE_SQL: &str = r#"
    DELETE FROM incident_outbox
     WHERE id = $1
       AND status = 'processing'
       AND available_at = $2
"#;

const REQUEUE_STALE_SQL: &str = r#"
    UPDATE incident_outbox
       SET status = 'pending',
           available_at = now()
     WHERE status = 'processing'
       AND available_at <= now() - make_interval(secs => $1)
    RETURNING id
"#;

const LIST_DEAD_SQL: &str = r#"
    SELECT id, event_type, payload, status, attempts, available_at, last_error, created_at
    FROM incident_outbox
    WHERE status = 'dead'
    ORDER BY id
    LIMIT $1
"#;

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let id = OutboxId::new(row.id);
        let status = row.status.parse::<OutboxStatus>().map_err(|e| StoreError::Corrupt {
            id,
            reason: e.to_string(),
        })?;
        let attempts = u32::try_from(row.attempts).map_err(|_| StoreError::Corrupt {
            id,
            reason: format!("negative attempts {}", row.attempts),
        })?;
        Ok(OutboxRecord {
            id,
            event_type: EventType::new(row.event_type),
            payload: row.payload,
            status,
            attempts,
            available_at: row.available_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// Decode claimed rows one by one, so a single bad row does not strand the
/// rest of the batch in `processing`. Records come back in id order.
fn decode_claimed(rows: Vec<OutboxRow>) -> (Vec<OutboxRecord>, Vec<(ClaimToken, StoreError)>) {
    let mut records = Vec::with_capacity(rows.len());
    let mut corrupt = Vec::new();
    for row in rows {
        let claim = ClaimToken {
            id: OutboxId::new(row.id),
            claimed_at: row.available_at,
        };
        match OutboxRecord::try_from(row) {
            Ok(record) => records.push(record),
            Err(e) => corrupt.push((claim, e)),
        }
    }
    // UPDATE .. RETURNING does not keep the CTE's order
    records.sort_by_key(|r| r.id);
    (records, corrupt)
}

fn bind_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn interval_secs(delay: Duration) -> f64 {
    delay.as_secs_f64().min(MAX_DELAY_SECS)
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table if it is missing. Meant for local setups and
    /// tests; production schemas belong to the producing service.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(CLAIM_SQL)
            .bind(bind_limit(limit))
            .fetch_all(&self.pool)
            .await?;

        let (records, corrupt) = decode_claimed(rows);
        for (claim, err) in corrupt {
            error!(outbox_id = %claim.id, error = %err, "dead-lettering undecodable outbox row");
            if let Err(e) = self.mark_dead(claim, &truncate_error(&err.to_string())).await {
                error!(outbox_id = %claim.id, error = %e, "outbox row left in processing");
            }
        }
        Ok(records)
    }

    async fn delete(&self, claim: ClaimToken) -> Result<bool, StoreError> {
        let done = sqlx::query(DELETE_SQL)
            .bind(claim.id.get())
            .bind(claim.claimed_at)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn reschedule(
        &self,
        claim: ClaimToken,
        delay: Duration,
        last_error: &str,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(RESCHEDULE_SQL)
            .bind(claim.id.get())
            .bind(interval_secs(delay))
            .bind(last_error)
            .bind(claim.claimed_at)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn mark_dead(&self, claim: ClaimToken, last_error: &str) -> Result<bool, StoreError> {
        let done = sqlx::query(MARK_DEAD_SQL)
            .bind(claim.id.get())
            .bind(last_error)
            .bind(claim.claimed_at)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn requeue_stale(&self, stale_after: Duration) -> Result<Vec<OutboxId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(REQUEUE_STALE_SQL)
            .bind(interval_secs(stale_after))
            .fetch_all(&self.pool)
            .await?;
        let mut ids: Vec<OutboxId> = ids.into_iter().map(OutboxId::new).collect();
        ids.sort();
        Ok(ids)
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM incident_outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = OutboxCounts::default();
        for (status, n) in rows {
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => counts.pending = n,
                Ok(OutboxStatus::Processing) => counts.processing = n,
                Ok(OutboxStatus::Dead) => counts.dead = n,
                Err(e) => warn!(error = %e, rows = n, "ignoring rows with unknown status"),
            }
        }
        Ok(counts)
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows: Vec<OutboxRow> = sqlx::query_as(LIST_DEAD_SQL)
            .bind(bind_limit(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }
}

/// Producer side: record `event_type` inside the caller's transaction, so
/// the event exists iff the domain write it describes commits.
///
/// `incident_id` fills the correlation column the incident API writes; the
/// drain itself never reads it.
pub async fn insert_outbox_event(
    tx: &mut Transaction<'_, Postgres>,
    event_type: &EventType,
    payload: &serde_json::Value,
    incident_id: Option<i64>,
) -> Result<OutboxId, StoreError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO incident_outbox (incident_id, event_type, payload)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(incident_id)
    .bind(event_type.as_str())
    .bind(payload)
    .fetch_one(&mut **tx)
    .await?;

    Ok(OutboxId::new(id))
}
