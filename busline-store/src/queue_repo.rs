use async_trait::async_trait;
use busline_core::queue::DelayedJob;
use busline_core::repository::DelayedQueue;
use busline_core::CoreResult;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::storage_error;

/// Delayed queue on a Postgres table. Claiming uses `FOR UPDATE SKIP LOCKED`
/// so concurrent pollers never take the same row.
pub struct PgDelayedQueue {
    pool: PgPool,
}

impl PgDelayedQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: String,
    not_before: DateTime<Utc>,
    dequeued_at: Option<DateTime<Utc>>,
    attempts: i32,
    created_at: DateTime<Utc>,
}

impl From<JobRow> for DelayedJob {
    fn from(row: JobRow) -> Self {
        DelayedJob {
            id: row.id,
            queue_name: row.queue_name,
            payload: row.payload,
            not_before: row.not_before,
            dequeued_at: row.dequeued_at,
            attempts: row.attempts,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl DelayedQueue for PgDelayedQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &str,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Uuid> {
        let job = DelayedJob::new(queue_name, payload, not_before, now);
        sqlx::query(
            "INSERT INTO delayed_jobs (id, queue_name, payload, not_before, attempts, created_at) VALUES ($1, $2, $3, $4, 0, $5)",
        )
        .bind(job.id)
        .bind(&job.queue_name)
        .bind(&job.payload)
        .bind(job.not_before)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(job.id)
    }

    async fn poll(
        &self,
        queue_name: &str,
        max_items: usize,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> CoreResult<Vec<DelayedJob>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE delayed_jobs
            SET dequeued_at = $2, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM delayed_jobs
                WHERE queue_name = $1
                  AND not_before <= $2
                  AND (dequeued_at IS NULL OR dequeued_at <= $3)
                ORDER BY not_before
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue_name, payload, not_before, dequeued_at, attempts, created_at
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .bind(now - visibility)
        .bind(max_items as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut jobs: Vec<DelayedJob> = rows.into_iter().map(DelayedJob::from).collect();
        jobs.sort_by_key(|job| job.not_before);
        Ok(jobs)
    }

    async fn ack(&self, job_id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM delayed_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }
}
