//! Job storage and the producer-facing queue.
//!
//! [`JobStore`] is the only component that touches persistent state. Every transition a
//! job goes through (claim, completion, failure, resubmission, recovery) is a single
//! store call, so stores can make each one atomic. Two backends ship with the crate:
//!
//! - [`memory::MemoryJobStore`], an in-process store driven by a [`Clock`](crate::clock::Clock)
//! - [`postgres::PostgresJobStore`] (feature `postgres`), built on sqlx
//!
//! [`JobQueue`] ties a store to a processor registry and a [`WorkerPool`]:
//!
//! ```rust
//! use dispatchwork::{
//!     DispatchConfig, JobOptions, JobPriority, JobQueue,
//!     queue::memory::MemoryJobStore, registry::handler_fn,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> dispatchwork::Result<()> {
//! let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), DispatchConfig::default())?;
//! queue
//!     .register_processor(
//!         "send_notification",
//!         handler_fn(|job, _ctx| async move { Ok(json!({"delivered": job.payload["to"]})) }),
//!         4,
//!     )
//!     .await;
//!
//! let job = queue
//!     .add_job(
//!         "send_notification",
//!         json!({"to": "+15550100"}),
//!         JobOptions::new().with_priority(JobPriority::High),
//!     )
//!     .await?;
//! assert_eq!(job.priority, JobPriority::High);
//! # Ok(())
//! # }
//! ```

use crate::{
    DispatchError, Result,
    config::DispatchConfig,
    job::{DeadLetterRecord, Job, JobId, JobOptions, JobStatus, WorkerId},
    metrics::PrometheusMetricsCollector,
    registry::{JobHandler, ProcessorRegistry},
    retry::{FailureDecision, RetryPolicy},
    scheduler::PriorityScheduler,
    stats::{InMemoryStatsCollector, JobStatistics, StatisticsCollector},
    worker::{WorkerInfo, WorkerPool},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Durable bookkeeping of job state.
///
/// Implementations must make `claim_ready` atomic per job: no two callers, in this
/// process or another, may ever claim the same job. A store that cannot guarantee that
/// for a given call returns no jobs instead.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new `pending` job scheduled at `now + options.delay`.
    ///
    /// `options.max_retries` must already be resolved; `None` falls back to
    /// [`DEFAULT_MAX_RETRIES`](crate::job::DEFAULT_MAX_RETRIES).
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job>;

    /// Claims up to `workers.len()` ready jobs of the given types in dispatch order.
    ///
    /// The i-th returned job is bound to `workers[i]` and is `processing`.
    async fn claim_ready(
        &self,
        job_types: &[String],
        workers: &[WorkerId],
        scheduler: &PriorityScheduler,
    ) -> Result<Vec<Job>>;

    /// Terminal success reported by `worker_id`. Completing a job that is already
    /// `completed` is a no-op.
    ///
    /// A report from a worker that no longer holds the claim (the job was requeued and
    /// claimed again) is refused with [`DispatchError::StaleClaim`] and changes nothing.
    async fn mark_completed(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<()>;

    /// Counts one failure of a `processing` job held by `worker_id` and applies `policy`.
    ///
    /// Stale reports are refused the same way as in [`mark_completed`](Self::mark_completed).
    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureDecision>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Moves a `pending` job to `cancelled`.
    async fn cancel(&self, job_id: JobId) -> Result<Job>;

    /// Returns a retry-exhausted `failed` job to `pending` with a fresh retry budget.
    /// Its `failure_count` is kept. Dead-lettered jobs are refused.
    async fn resubmit(&self, job_id: JobId) -> Result<Job>;

    /// Returns `processing` jobs claimed more than `older_than` ago to `pending`.
    async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<JobId>>;

    /// Dead-letter records, newest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>>;

    /// Status counts plus processing statistics over `window`.
    async fn metrics(&self, window: Duration) -> Result<QueueMetrics>;
}

/// Snapshot of the store.
///
/// Status counts cover every job in the store. Completion, failure and duration
/// figures only cover jobs that finished inside `window`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
    pub completed_in_window: u64,
    pub failed_in_window: u64,
    pub avg_processing_time_ms: f64,
    pub p50_processing_time_ms: f64,
    pub p95_processing_time_ms: f64,
    pub p99_processing_time_ms: f64,
    /// failed / (completed + failed), over the window
    pub error_rate: f64,
    pub window: Duration,
    pub calculated_at: DateTime<Utc>,
}

impl QueueMetrics {
    pub fn empty(window: Duration, calculated_at: DateTime<Utc>) -> Self {
        Self {
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            dead_lettered: 0,
            completed_in_window: 0,
            failed_in_window: 0,
            avg_processing_time_ms: 0.0,
            p50_processing_time_ms: 0.0,
            p95_processing_time_ms: 0.0,
            p99_processing_time_ms: 0.0,
            error_rate: 0.0,
            window,
            calculated_at,
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn set_count(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending = count,
            JobStatus::Processing => self.processing = count,
            JobStatus::Completed => self.completed = count,
            JobStatus::Failed => self.failed = count,
            JobStatus::Cancelled => self.cancelled = count,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::all().iter().map(|s| self.count(*s)).sum()
    }

    /// Fills in the duration figures from raw samples in milliseconds.
    pub fn with_durations(mut self, mut durations_ms: Vec<i64>) -> Self {
        if durations_ms.is_empty() {
            return self;
        }
        durations_ms.sort_unstable();
        let sum: i64 = durations_ms.iter().sum();
        self.avg_processing_time_ms = sum as f64 / durations_ms.len() as f64;
        self.p50_processing_time_ms = percentile(&durations_ms, 50.0);
        self.p95_processing_time_ms = percentile(&durations_ms, 95.0);
        self.p99_processing_time_ms = percentile(&durations_ms, 99.0);
        self
    }

    pub fn with_window_outcomes(mut self, completed: u64, failed: u64) -> Self {
        self.completed_in_window = completed;
        self.failed_in_window = failed;
        self.error_rate = error_rate(completed, failed);
        self
    }
}

/// Nearest-rank percentile of an ascending slice.
pub(crate) fn percentile(sorted: &[i64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index] as f64
}

pub(crate) fn error_rate(completed: u64, failed: u64) -> f64 {
    let total = completed + failed;
    if total == 0 {
        0.0
    } else {
        failed as f64 / total as f64
    }
}

pub(crate) fn invalid_transition(job: &Job, action: &'static str) -> DispatchError {
    let from = if job.is_dead_lettered() {
        "dead-lettered".to_string()
    } else {
        job.status.to_string()
    };
    DispatchError::InvalidTransition {
        id: job.id.to_string(),
        from,
        action,
    }
}

pub(crate) fn stale_claim(job: &Job, worker_id: &str) -> DispatchError {
    DispatchError::StaleClaim {
        id: job.id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

/// Producer and operator entry point: a store, the processors registered against it
/// and the worker pool that runs them.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: DispatchConfig,
    registry: Arc<RwLock<ProcessorRegistry>>,
    pool: WorkerPool,
    stats_collector: Arc<dyn StatisticsCollector>,
    metrics_collector: Option<Arc<PrometheusMetricsCollector>>,
}

impl JobQueue {
    /// Validates `config` and builds a queue over `store`. Workers are not started.
    pub fn new(store: Arc<dyn JobStore>, config: DispatchConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(RwLock::new(ProcessorRegistry::new()));
        let stats_collector: Arc<dyn StatisticsCollector> =
            Arc::new(InMemoryStatsCollector::new_default());
        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.worker.clone(),
            PriorityScheduler::new(config.priority.clone()),
            config.retry.policy(),
        )
        .with_stats_collector(Arc::clone(&stats_collector));

        let queue = Self {
            store,
            config,
            registry,
            pool,
            stats_collector,
            metrics_collector: None,
        };
        if !queue.config.metrics.enabled {
            return Ok(queue);
        }
        let metrics = Arc::new(PrometheusMetricsCollector::new(&queue.config.metrics)?);
        Ok(queue.with_metrics_collector(metrics))
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.pool = self.pool.with_stats_collector(Arc::clone(&stats_collector));
        self.stats_collector = stats_collector;
        self
    }

    pub fn with_metrics_collector(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.pool = self.pool.with_metrics_collector(Arc::clone(&metrics));
        self.metrics_collector = Some(metrics);
        self
    }

    /// The Prometheus collector, built from `config.metrics` when it is enabled or
    /// supplied through [`with_metrics_collector`](Self::with_metrics_collector).
    pub fn metrics_collector(&self) -> Option<Arc<PrometheusMetricsCollector>> {
        self.metrics_collector.clone()
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Registers `handler` for `job_type` with a soft in-flight cap of `concurrency`.
    ///
    /// Takes effect on the next poll tick, also while the pool is running.
    pub async fn register_processor(
        &self,
        job_type: impl Into<String>,
        handler: JobHandler,
        concurrency: usize,
    ) {
        let job_type = job_type.into();
        let previous = self
            .registry
            .write()
            .await
            .register(job_type.clone(), handler, concurrency);
        if previous.is_some() {
            warn!(job_type = %job_type, "replaced existing processor registration");
        } else {
            debug!(job_type = %job_type, concurrency, "registered processor");
        }
    }

    /// Persists a new job and wakes the poll loop. Never waits for the job to run.
    pub async fn add_job(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let mut options = options;
        let max_retries = *options
            .max_retries
            .get_or_insert(self.config.retry.default_max_retries);

        if max_retries < 0 {
            return Err(DispatchError::Config(format!(
                "max_retries must not be negative, got {}",
                max_retries
            )));
        }
        if max_retries > self.config.retry.dead_letter_threshold {
            return Err(DispatchError::Config(format!(
                "max_retries ({}) exceeds the dead-letter threshold ({})",
                max_retries, self.config.retry.dead_letter_threshold
            )));
        }

        let job = self.store.enqueue(job_type, payload, &options).await?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            scheduled_at = %job.scheduled_at,
            "job enqueued"
        );

        if let Some(metrics) = &self.metrics_collector {
            metrics.record_enqueued(&job.job_type, job.priority);
        }
        self.pool.wake();
        Ok(job)
    }

    /// Starts the worker pool, and the metrics endpoint when the collector has a bind
    /// address. Starting a running pool only logs a warning.
    pub async fn start(&self) -> Result<()> {
        if self.registry.read().await.is_empty() && self.config.worker.job_types.is_none() {
            warn!("starting worker pool with no registered processors");
        }
        if let Some(metrics) = &self.metrics_collector {
            metrics.start_exposition_server()?;
        }
        self.pool.start().await
    }

    /// Stops claiming and waits up to the shutdown timeout for in-flight jobs.
    pub async fn stop(&self) -> Result<()> {
        self.pool.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.pool.is_running().await
    }

    /// Store metrics over the configured window.
    pub async fn get_metrics(&self) -> Result<QueueMetrics> {
        let metrics = self.store.metrics(self.config.worker.metrics_window).await?;
        if let Some(collector) = &self.metrics_collector {
            collector.update_queue_metrics(&metrics);
        }
        Ok(metrics)
    }

    /// Timeouts, retries and unknown-type failures seen by this process over `window`.
    pub async fn runtime_statistics(&self, window: Duration) -> Result<JobStatistics> {
        self.stats_collector.get_system_statistics(window).await
    }

    pub async fn get_workers(&self) -> Vec<WorkerInfo> {
        self.pool.workers().await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.cancel(job_id).await?;
        info!(job_id = %job_id, "job cancelled");
        Ok(job)
    }

    pub async fn resubmit(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.resubmit(job_id).await?;
        info!(job_id = %job_id, failure_count = job.failure_count, "job resubmitted");
        self.pool.wake();
        Ok(job)
    }

    /// Recovery sweep for claims left behind by a stopped or crashed pool.
    pub async fn recover_stale(&self, older_than: Duration) -> Result<Vec<JobId>> {
        let recovered = self.store.requeue_stale(older_than).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), ?older_than, "requeued stale processing jobs");
            self.pool.wake();
        }
        Ok(recovered)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        self.store.dead_letters(limit).await
    }

    /// Registered job types, sorted.
    pub async fn job_types(&self) -> Vec<String> {
        self.registry.read().await.job_types()
    }

    /// Job counts per status, from a fresh metrics snapshot.
    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, u64>> {
        let metrics = self.get_metrics().await?;
        Ok(JobStatus::all()
            .into_iter()
            .map(|status| (status, metrics.count(status)))
            .collect())
    }
}
