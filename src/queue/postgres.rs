//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a transaction, so any number of pools in
//! any number of processes can poll the same tables. Failure handling locks the job
//! row, runs the [`RetryPolicy`] on the locked state and writes the outcome (plus the
//! dead-letter record, when there is one) in the same transaction.

use super::{JobStore, QueueMetrics, invalid_transition, stale_claim};
use crate::{
    DispatchError, Result,
    clock::window_start,
    job::{DeadLetterRecord, Job, JobId, JobOptions, JobStatus, WorkerId},
    priority::JobPriority,
    retry::{FailureDecision, RetryPolicy},
    scheduler::PriorityScheduler,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, warn};

const JOB_COLUMNS: &str = "id, job_type, status, priority, payload, result, error_message, \
     retry_count, max_retries, failure_count, scheduled_at, started_at, completed_at, \
     worker_id, dead_lettered_at, created_at, updated_at";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub id: uuid::Uuid,
    pub job_type: String,
    pub status: String,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub failure_count: i32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        let priority = JobPriority::from_i32(self.priority).map_err(|e| DispatchError::Store {
            message: format!("job {} has an invalid priority: {}", self.id, e),
        })?;
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            status: self.status.parse()?,
            priority,
            payload: self.payload,
            result: self.result,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            failure_count: self.failure_count,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            worker_id: self.worker_id,
            dead_lettered_at: self.dead_lettered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DeadLetterRow {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub retry_count: i32,
    pub failure_count: i32,
    pub created_at: DateTime<Utc>,
}

impl From<DeadLetterRow> for DeadLetterRecord {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetterRecord {
            id: row.id,
            job_id: row.job_id,
            job_type: row.job_type,
            payload: row.payload,
            error_message: row.error_message,
            retry_count: row.retry_count,
            failure_count: row.failure_count,
            created_at: row.created_at,
        }
    }
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with the given URL and pool size.
    pub async fn connect(url: &str, max_connections: u32, acquire_timeout: Duration) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the job and dead-letter tables and their indexes if missing.
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS dispatchwork_jobs (
                id UUID PRIMARY KEY,
                job_type VARCHAR NOT NULL,
                status VARCHAR NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 1,
                payload JSONB NOT NULL,
                result JSONB,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                failure_count INTEGER NOT NULL DEFAULT 0,
                scheduled_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                worker_id VARCHAR,
                dead_lettered_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatchwork_jobs_dispatch
                ON dispatchwork_jobs (status, priority DESC, scheduled_at)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatchwork_jobs_type_status
                ON dispatchwork_jobs (job_type, status)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_dispatchwork_jobs_completed_at
                ON dispatchwork_jobs (completed_at)
                WHERE completed_at IS NOT NULL
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dispatchwork_dead_letters (
                id UUID PRIMARY KEY,
                job_id UUID NOT NULL,
                job_type VARCHAR NOT NULL,
                payload JSONB NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failure_count INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_dispatchwork_dead_letters_job
                ON dispatchwork_dead_letters (job_id)
            "#,
        ];

        let mut tx = self.pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("dispatchwork tables are in place");
        Ok(())
    }

    async fn lock_job(tx: &mut Transaction<'_, Postgres>, job_id: JobId) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM dispatchwork_jobs WHERE id = $1 FOR UPDATE",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| DispatchError::JobNotFound {
            id: job_id.to_string(),
        })?
        .into_job()
    }

    /// Explains why a conditional update matched no row.
    async fn rejected(&self, job_id: JobId, action: &'static str) -> DispatchError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => invalid_transition(&job, action),
            Ok(None) => DispatchError::JobNotFound {
                id: job_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job> {
        let job = Job::new(job_type, payload, options, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO dispatchwork_jobs (
                id, job_type, status, priority, payload, retry_count, max_retries,
                failure_count, scheduled_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(job.priority.as_i32())
        .bind(&job.payload)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.failure_count)
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_ready(
        &self,
        job_types: &[String],
        workers: &[WorkerId],
        scheduler: &PriorityScheduler,
    ) -> Result<Vec<Job>> {
        if job_types.is_empty() || workers.is_empty() {
            return Ok(Vec::new());
        }

        let weights = scheduler.weights();
        let (weight_types, weight_values): (Vec<String>, Vec<i32>) = weights
            .weights()
            .iter()
            .map(|(job_type, weight)| (job_type.clone(), *weight))
            .unzip();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let selected: Vec<JobId> = sqlx::query_scalar(
            r#"
            SELECT j.id
            FROM dispatchwork_jobs j
            LEFT JOIN unnest($1::text[], $2::int[]) AS w(job_type, weight)
                ON w.job_type = j.job_type
            WHERE j.status = 'pending'
              AND j.scheduled_at <= $3
              AND j.job_type = ANY($4)
            ORDER BY j.priority DESC,
                     COALESCE(w.weight, $5) DESC,
                     j.scheduled_at ASC,
                     j.created_at ASC,
                     j.id ASC
            LIMIT $6
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(&weight_types)
        .bind(&weight_values)
        .bind(now)
        .bind(job_types)
        .bind(weights.default_weight())
        .bind(workers.len() as i64)
        .fetch_all(&mut *tx)
        .await?;

        if selected.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let bound_workers: Vec<String> = workers[..selected.len()].to_vec();
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE dispatchwork_jobs AS j
            SET status = 'processing', worker_id = c.worker_id, started_at = $1, updated_at = $1
            FROM unnest($2::uuid[], $3::text[]) AS c(id, worker_id)
            WHERE j.id = c.id AND j.status = 'pending'
            RETURNING j.*
            "#,
        )
        .bind(now)
        .bind(&selected)
        .bind(&bound_workers)
        .fetch_all(&mut *tx)
        .await?;

        if rows.len() != selected.len() {
            warn!(
                selected = selected.len(),
                updated = rows.len(),
                "claim matched fewer rows than it locked; rolling back"
            );
            tx.rollback().await?;
            return Ok(Vec::new());
        }
        tx.commit().await?;

        let mut by_id: HashMap<JobId, Job> = HashMap::with_capacity(rows.len());
        for row in rows {
            let job = row.into_job()?;
            by_id.insert(job.id, job);
        }
        Ok(selected.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn mark_completed(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            r#"
            UPDATE dispatchwork_jobs
            SET status = 'completed', result = $2, completed_at = $3, worker_id = NULL, updated_at = $3
            WHERE id = $1 AND status = 'processing' AND worker_id = $4
            "#,
        )
        .bind(job_id)
        .bind(&result)
        .bind(now)
        .bind(worker_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }
        match self.get_job(job_id).await? {
            Some(job) if job.status == JobStatus::Completed => Ok(()),
            Some(job) if job.status == JobStatus::Processing => Err(stale_claim(&job, worker_id)),
            Some(job) => Err(invalid_transition(&job, "complete")),
            None => Err(DispatchError::JobNotFound {
                id: job_id.to_string(),
            }),
        }
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureDecision> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;

        if job.status != JobStatus::Processing {
            tx.rollback().await?;
            return Err(invalid_transition(&job, "fail"));
        }
        if !job.is_claimed_by(worker_id) {
            tx.rollback().await?;
            return Err(stale_claim(&job, worker_id));
        }

        let decision = policy.decide(&job, now);
        match &decision {
            FailureDecision::Retry {
                retry_count,
                failure_count,
                scheduled_at,
                ..
            } => {
                sqlx::query(
                    r#"
                    UPDATE dispatchwork_jobs
                    SET status = 'pending', retry_count = $2, failure_count = $3,
                        scheduled_at = $4, error_message = $5, started_at = NULL,
                        worker_id = NULL, updated_at = $6
                    WHERE id = $1 AND worker_id = $7
                    "#,
                )
                .bind(job_id)
                .bind(retry_count)
                .bind(failure_count)
                .bind(scheduled_at)
                .bind(error_message)
                .bind(now)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
            FailureDecision::Exhausted {
                retry_count,
                failure_count,
            } => {
                sqlx::query(
                    r#"
                    UPDATE dispatchwork_jobs
                    SET status = 'failed', retry_count = $2, failure_count = $3,
                        error_message = $4, completed_at = $5, worker_id = NULL, updated_at = $5
                    WHERE id = $1 AND worker_id = $6
                    "#,
                )
                .bind(job_id)
                .bind(retry_count)
                .bind(failure_count)
                .bind(error_message)
                .bind(now)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
            }
            FailureDecision::DeadLetter {
                retry_count,
                failure_count,
            } => {
                sqlx::query(
                    r#"
                    UPDATE dispatchwork_jobs
                    SET status = 'failed', retry_count = $2, failure_count = $3,
                        error_message = $4, completed_at = $5, dead_lettered_at = $5,
                        worker_id = NULL, updated_at = $5
                    WHERE id = $1 AND worker_id = $6
                    "#,
                )
                .bind(job_id)
                .bind(retry_count)
                .bind(failure_count)
                .bind(error_message)
                .bind(now)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;

                let mut dead = job.clone();
                dead.retry_count = *retry_count;
                dead.failure_count = *failure_count;
                let record = DeadLetterRecord::for_job(&dead, error_message, now);
                sqlx::query(
                    r#"
                    INSERT INTO dispatchwork_dead_letters (
                        id, job_id, job_type, payload, error_message, retry_count,
                        failure_count, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(record.id)
                .bind(record.job_id)
                .bind(&record.job_type)
                .bind(&record.payload)
                .bind(&record.error_message)
                .bind(record.retry_count)
                .bind(record.failure_count)
                .bind(record.created_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(decision)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM dispatchwork_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE dispatchwork_jobs
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_job(),
            None => Err(self.rejected(job_id, "cancel").await),
        }
    }

    async fn resubmit(&self, job_id: JobId) -> Result<Job> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE dispatchwork_jobs
            SET status = 'pending', retry_count = 0, scheduled_at = $2, started_at = NULL,
                completed_at = NULL, updated_at = $2
            WHERE id = $1 AND status = 'failed' AND dead_lettered_at IS NULL
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_job(),
            None => Err(self.rejected(job_id, "resubmit").await),
        }
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<JobId>> {
        let now = Utc::now();
        let cutoff = window_start(now, older_than);

        let requeued: Vec<JobId> = sqlx::query_scalar(
            r#"
            UPDATE dispatchwork_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL,
                scheduled_at = $2, updated_at = $2
            WHERE status = 'processing' AND (started_at IS NULL OR started_at <= $1)
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(requeued)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            r#"
            SELECT id, job_id, job_type, payload, error_message, retry_count, failure_count, created_at
            FROM dispatchwork_dead_letters
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeadLetterRecord::from).collect())
    }

    async fn metrics(&self, window: Duration) -> Result<QueueMetrics> {
        let now = Utc::now();
        let since = window_start(now, window);

        let mut metrics = QueueMetrics::empty(window, now);

        let counts = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM dispatchwork_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in counts {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            metrics.set_count(status.parse()?, count.max(0) as u64);
        }

        let dead_lettered: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dispatchwork_dead_letters")
            .fetch_one(&self.pool)
            .await?;
        metrics.dead_lettered = dead_lettered.max(0) as u64;

        let window_row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM dispatchwork_jobs
            WHERE completed_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let completed: i64 = window_row.try_get("completed")?;
        let failed: i64 = window_row.try_get("failed")?;
        metrics = metrics.with_window_outcomes(completed.max(0) as u64, failed.max(0) as u64);

        // percentile_disc matches the nearest-rank percentiles of the in-memory store
        let timing = sqlx::query(
            r#"
            SELECT
                AVG(d)::FLOAT8 AS avg_ms,
                percentile_disc(0.5) WITHIN GROUP (ORDER BY d)::FLOAT8 AS p50_ms,
                percentile_disc(0.95) WITHIN GROUP (ORDER BY d)::FLOAT8 AS p95_ms,
                percentile_disc(0.99) WITHIN GROUP (ORDER BY d)::FLOAT8 AS p99_ms
            FROM (
                SELECT (EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)::BIGINT AS d
                FROM dispatchwork_jobs
                WHERE status = 'completed' AND completed_at >= $1 AND started_at IS NOT NULL
            ) durations
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        metrics.avg_processing_time_ms = timing.try_get::<Option<f64>, _>("avg_ms")?.unwrap_or(0.0);
        metrics.p50_processing_time_ms = timing.try_get::<Option<f64>, _>("p50_ms")?.unwrap_or(0.0);
        metrics.p95_processing_time_ms = timing.try_get::<Option<f64>, _>("p95_ms")?.unwrap_or(0.0);
        metrics.p99_processing_time_ms = timing.try_get::<Option<f64>, _>("p99_ms")?.unwrap_or(0.0);

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, priority: i32) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: uuid::Uuid::new_v4(),
            job_type: "send_sms".to_string(),
            status: status.to_string(),
            priority,
            payload: serde_json::json!({"to": "+15550100"}),
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: 3,
            failure_count: 0,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            worker_id: None,
            dead_lettered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_conversion() {
        let job = row("processing", 2).into_job().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.priority, JobPriority::High);
    }

    #[test]
    fn test_corrupt_rows_are_store_errors() {
        assert!(matches!(
            row("running", 1).into_job(),
            Err(DispatchError::Store { .. })
        ));
        assert!(matches!(
            row("pending", 9).into_job(),
            Err(DispatchError::Store { .. })
        ));
    }
}
