//! PostgreSQL store implementation.

use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DeadLetter, DeadLetterQuery, Delivery, StepLedger, Store};
use crate::error::Result;
use crate::event::NewEvent;

/// PostgreSQL-backed store for production use.
///
/// Events are claimed with `FOR UPDATE SKIP LOCKED`, so any number of
/// delivery workers can poll the same table without contending.
///
/// # Database Schema
///
/// Requires tables in the `outflow` schema:
///
/// | Table         | Purpose                                            |
/// |---------------|----------------------------------------------------|
/// | `events`      | Event queue with delivery scheduling and retries   |
/// | `step_ledger` | Memoized step results keyed by `(run_id, name)`    |
/// | `cron_jobs`   | Last-fired bookkeeping for the cron dispatcher     |
///
/// # Example
///
/// ```ignore
/// use outflow::PgStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    run_id: Uuid,
    name: String,
    payload: Value,
    attempts: i32,
    created_at: OffsetDateTime,
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    run_id: Uuid,
    name: String,
    payload: Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetter {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            payload: row.payload,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_dead_letter_filters(
    builder: &mut sqlx::QueryBuilder<'_, sqlx::Postgres>,
    query: &DeadLetterQuery,
    max_attempts: u32,
) {
    builder.push(" WHERE processed_at IS NULL AND attempts >= ");
    builder.push_bind(max_attempts as i32);
    if let Some(name) = &query.event_name {
        builder.push(" AND name = ");
        builder.push_bind(name.clone());
    }
    if let Some(run_id) = query.run_id {
        builder.push(" AND run_id = ");
        builder.push_bind(run_id);
    }
}

impl Store for PgStore {
    async fn enqueue(&self, events: Vec<NewEvent>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            if let Some(key) = &event.dedupe_key {
                sqlx::query(
                    r#"
                    DELETE FROM outflow.events
                    WHERE dedupe_key = $1
                      AND processed_at IS NULL
                      AND (locked_until IS NULL OR locked_until <= now())
                    "#,
                )
                .bind(key)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                r#"
                INSERT INTO outflow.events
                    (id, run_id, name, payload, deliver_at, dedupe_key, created_at)
                VALUES ($1, $2, $3, $4, COALESCE($5, now()), $6, now())
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(event.run_id.unwrap_or_else(Uuid::now_v7))
            .bind(&event.name)
            .bind(&event.payload)
            .bind(event.deliver_at)
            .bind(&event.dedupe_key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn claim_event(
        &self,
        worker_id: &str,
        lock_duration: Duration,
        max_attempts: u32,
    ) -> Result<Option<Delivery>> {
        let row: Option<ClaimRow> = sqlx::query_as(
            r#"
            UPDATE outflow.events
            SET locked_until = now() + $2 * interval '1 second',
                locked_by = $1
            WHERE id = (
                SELECT id FROM outflow.events
                WHERE processed_at IS NULL
                  AND deliver_at <= now()
                  AND (locked_until IS NULL OR locked_until <= now())
                  AND attempts < $3
                ORDER BY deliver_at ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, run_id, name, payload, attempts, created_at
            "#,
        )
        .bind(worker_id)
        .bind(lock_duration.as_secs_f64())
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Delivery {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            payload: row.payload,
            attempts: row.attempts as u32,
            created_at: row.created_at,
        }))
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outflow.events
            SET processed_at = now(), locked_until = NULL, locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        event_id: Uuid,
        error: &str,
        backoff_duration: Duration,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outflow.events
            SET attempts = attempts + 1,
                last_error = $2,
                locked_until = now() + $3 * interval '1 second',
                locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(backoff_duration.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        event_id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outflow.events
            SET attempts = $3, last_error = $2, locked_until = NULL, locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(max_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_ledger(&self, run_id: Uuid) -> Result<StepLedger> {
        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT step_name, value FROM outflow.step_ledger
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn record_step(&self, run_id: Uuid, step_name: &str, value: Value) -> Result<()> {
        // First write wins: replays never overwrite a recorded result.
        sqlx::query(
            r#"
            INSERT INTO outflow.step_ledger (run_id, step_name, value, recorded_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (run_id, step_name) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .bind(&value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<Vec<DeadLetter>> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, run_id, name, payload, attempts, last_error, created_at FROM outflow.events",
        );
        push_dead_letter_filters(&mut builder, query, max_attempts);
        builder.push(" ORDER BY created_at ASC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder
            .build_query_as::<DeadLetterRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }

    async fn count_dead_letters(
        &self,
        query: &DeadLetterQuery,
        max_attempts: u32,
    ) -> Result<u64> {
        let mut builder = sqlx::QueryBuilder::new("SELECT count(*) FROM outflow.events");
        push_dead_letter_filters(&mut builder, query, max_attempts);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as u64)
    }

    async fn retry_dead_letter(&self, event_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outflow.events
            SET attempts = 0, locked_until = NULL, locked_by = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cron_last_fired(&self, job_name: &str) -> Result<Option<OffsetDateTime>> {
        let fired_at: Option<(OffsetDateTime,)> = sqlx::query_as(
            r#"
            SELECT fired_at FROM outflow.cron_jobs WHERE job_name = $1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(fired_at.map(|(at,)| at))
    }

    async fn set_cron_last_fired(
        &self,
        job_name: &str,
        fired_at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outflow.cron_jobs (job_name, fired_at)
            VALUES ($1, $2)
            ON CONFLICT (job_name) DO UPDATE SET fired_at = EXCLUDED.fired_at
            "#,
        )
        .bind(job_name)
        .bind(fired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
