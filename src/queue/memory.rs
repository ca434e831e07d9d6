//! In-process job store.
//!
//! All state lives behind one `tokio::sync::RwLock`; every mutating operation holds the
//! write lock for its whole read-modify-write, which is what makes `claim_ready` atomic.
//! Time comes from a [`Clock`], so delayed jobs and backoff can be driven by a
//! [`MockClock`](crate::clock::MockClock) in tests:
//!
//! ```rust
//! use dispatchwork::{
//!     JobOptions, JobStore, PriorityScheduler,
//!     clock::MockClock,
//!     queue::memory::MemoryJobStore,
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> dispatchwork::Result<()> {
//! let clock = MockClock::new();
//! let store = MemoryJobStore::with_clock(Arc::new(clock.clone()));
//! let scheduler = PriorityScheduler::default();
//! let types = vec!["schedule_follow_up".to_string()];
//! let workers = vec!["worker-0".to_string()];
//!
//! store
//!     .enqueue(
//!         "schedule_follow_up",
//!         json!({}),
//!         &JobOptions::new().with_delay(Duration::from_secs(3600)),
//!     )
//!     .await?;
//! assert!(store.claim_ready(&types, &workers, &scheduler).await?.is_empty());
//!
//! clock.advance(chrono::Duration::hours(1));
//! assert_eq!(store.claim_ready(&types, &workers, &scheduler).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

use super::{JobStore, QueueMetrics, invalid_transition, stale_claim};
use crate::{
    DispatchError, Result,
    clock::{Clock, SystemClock, window_start},
    job::{DeadLetterRecord, Job, JobId, JobOptions, JobStatus, WorkerId},
    retry::{FailureDecision, RetryPolicy},
    scheduler::PriorityScheduler,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryStorage {
    jobs: HashMap<JobId, Job>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl MemoryStorage {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| DispatchError::JobNotFound {
                id: job_id.to_string(),
            })
    }
}

#[derive(Debug)]
pub struct MemoryJobStore {
    storage: RwLock<MemoryStorage>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    /// A store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            storage: RwLock::new(MemoryStorage::default()),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Number of jobs currently in `status`.
    pub async fn job_count(&self, status: JobStatus) -> usize {
        let storage = self.storage.read().await;
        storage.jobs.values().filter(|j| j.status == status).count()
    }

    /// Every job in the store, oldest first.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let storage = self.storage.read().await;
        let mut jobs: Vec<Job> = storage.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Result<Job> {
        let job = Job::new(job_type, payload, options, self.clock.now());
        let mut storage = self.storage.write().await;
        storage.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_ready(
        &self,
        job_types: &[String],
        workers: &[WorkerId],
        scheduler: &PriorityScheduler,
    ) -> Result<Vec<Job>> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();

        let selected = scheduler.select_ready(storage.jobs.values(), job_types, now, workers.len());

        let mut claimed = Vec::with_capacity(selected.len());
        for (job_id, worker_id) in selected.into_iter().zip(workers) {
            let job = storage.job_mut(job_id)?;
            job.status = JobStatus::Processing;
            job.worker_id = Some(worker_id.clone());
            job.started_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();
        let job = storage.job_mut(job_id)?;

        match job.status {
            JobStatus::Completed => Ok(()),
            JobStatus::Processing if !job.is_claimed_by(worker_id) => {
                Err(stale_claim(job, worker_id))
            }
            JobStatus::Processing => {
                job.status = JobStatus::Completed;
                job.result = Some(result);
                job.completed_at = Some(now);
                job.worker_id = None;
                job.updated_at = now;
                Ok(())
            }
            _ => Err(invalid_transition(job, "complete")),
        }
    }

    async fn mark_failed(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureDecision> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();
        let job = storage.job_mut(job_id)?;

        if job.status != JobStatus::Processing {
            return Err(invalid_transition(job, "fail"));
        }
        if !job.is_claimed_by(worker_id) {
            return Err(stale_claim(job, worker_id));
        }

        let decision = policy.decide(job, now);
        job.error_message = Some(error_message.to_string());
        job.worker_id = None;
        job.updated_at = now;

        match &decision {
            FailureDecision::Retry {
                retry_count,
                failure_count,
                scheduled_at,
                ..
            } => {
                job.status = JobStatus::Pending;
                job.retry_count = *retry_count;
                job.failure_count = *failure_count;
                job.scheduled_at = *scheduled_at;
                job.started_at = None;
            }
            FailureDecision::Exhausted {
                retry_count,
                failure_count,
            } => {
                job.status = JobStatus::Failed;
                job.retry_count = *retry_count;
                job.failure_count = *failure_count;
                job.completed_at = Some(now);
            }
            FailureDecision::DeadLetter {
                retry_count,
                failure_count,
            } => {
                job.status = JobStatus::Failed;
                job.retry_count = *retry_count;
                job.failure_count = *failure_count;
                job.completed_at = Some(now);
                job.dead_lettered_at = Some(now);
                let record = DeadLetterRecord::for_job(job, error_message, now);
                storage.dead_letters.push(record);
            }
        }

        Ok(decision)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let storage = self.storage.read().await;
        Ok(storage.jobs.get(&job_id).cloned())
    }

    async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();
        let job = storage.job_mut(job_id)?;

        if job.status != JobStatus::Pending {
            return Err(invalid_transition(job, "cancel"));
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn resubmit(&self, job_id: JobId) -> Result<Job> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();
        let job = storage.job_mut(job_id)?;

        if job.status != JobStatus::Failed || job.is_dead_lettered() {
            return Err(invalid_transition(job, "resubmit"));
        }
        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.scheduled_at = now;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<JobId>> {
        let mut storage = self.storage.write().await;
        let now = self.clock.now();
        let cutoff = window_start(now, older_than);

        let mut requeued = Vec::new();
        for job in storage.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_none_or(|started| started <= cutoff);
            if stale {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                job.scheduled_at = now;
                job.updated_at = now;
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let storage = self.storage.read().await;
        let mut records = storage.dead_letters.clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn metrics(&self, window: Duration) -> Result<QueueMetrics> {
        let storage = self.storage.read().await;
        let now = self.clock.now();
        let since = window_start(now, window);

        let mut metrics = QueueMetrics::empty(window, now);
        let mut counts: HashMap<JobStatus, u64> = HashMap::new();
        let mut durations = Vec::new();
        let mut completed_in_window = 0;
        let mut failed_in_window = 0;

        for job in storage.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;

            let finished_in_window = job.completed_at.is_some_and(|at| at >= since);
            match job.status {
                JobStatus::Completed if finished_in_window => {
                    completed_in_window += 1;
                    if let Some(elapsed) = job.processing_time() {
                        durations.push(elapsed.num_milliseconds());
                    }
                }
                JobStatus::Failed if finished_in_window => failed_in_window += 1,
                _ => {}
            }
        }

        for (status, count) in counts {
            metrics.set_count(status, count);
        }
        metrics.dead_lettered = storage.dead_letters.len() as u64;

        Ok(metrics
            .with_durations(durations)
            .with_window_outcomes(completed_in_window, failed_in_window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::MockClock, priority::JobPriority, retry::RetryStrategy};
    use serde_json::json;

    fn store() -> (MemoryJobStore, MockClock) {
        let clock = MockClock::new();
        (MemoryJobStore::with_clock(Arc::new(clock.clone())), clock)
    }

    fn types(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn workers(n: usize) -> Vec<WorkerId> {
        (0..n).map(|i| format!("worker-{}", i)).collect()
    }

    #[tokio::test]
    async fn test_enqueue_uses_store_clock() {
        let (store, clock) = store();
        let job = store
            .enqueue(
                "sync_calendar_event",
                json!({"event": 1}),
                &JobOptions::new().with_delay(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert_eq!(job.created_at, clock.now());
        assert_eq!(job.scheduled_at, clock.now() + chrono::Duration::seconds(30));
        assert_eq!(store.job_count(JobStatus::Pending).await, 1);
    }

    #[tokio::test]
    async fn test_claim_binds_each_job_to_one_worker() {
        let (store, _clock) = store();
        let scheduler = PriorityScheduler::default();
        for _ in 0..3 {
            store
                .enqueue("create_quote", json!({}), &JobOptions::new())
                .await
                .unwrap();
        }

        let claimed = store
            .claim_ready(&types(&["create_quote"]), &workers(2), &scheduler)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].worker_id.as_deref(), Some("worker-0"));
        assert_eq!(claimed[1].worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing));

        let rest = store
            .claim_ready(&types(&["create_quote"]), &workers(5), &scheduler)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert!(claimed.iter().all(|j| j.id != rest[0].id));
    }

    #[tokio::test]
    async fn test_claim_respects_priority_order() {
        let (store, _clock) = store();
        let scheduler = PriorityScheduler::default();

        let mut ids = HashMap::new();
        for priority in [JobPriority::Low, JobPriority::High, JobPriority::Emergency] {
            let job = store
                .enqueue(
                    "create_quote",
                    json!({}),
                    &JobOptions::new().with_priority(priority),
                )
                .await
                .unwrap();
            ids.insert(job.id, priority);
        }

        let claimed = store
            .claim_ready(&types(&["create_quote"]), &workers(3), &scheduler)
            .await
            .unwrap();
        let order: Vec<JobPriority> = claimed.iter().map(|j| ids[&j.id]).collect();
        assert_eq!(
            order,
            vec![JobPriority::Emergency, JobPriority::High, JobPriority::Low]
        );
    }

    #[tokio::test]
    async fn test_mark_completed_is_idempotent() {
        let (store, _clock) = store();
        let scheduler = PriorityScheduler::default();
        let job = store
            .enqueue("generate_report", json!({}), &JobOptions::new())
            .await
            .unwrap();
        store
            .claim_ready(&types(&["generate_report"]), &workers(1), &scheduler)
            .await
            .unwrap();

        store.mark_completed(job.id, "worker-0", json!({"rows": 3})).await.unwrap();
        let once = store.get_job(job.id).await.unwrap().unwrap();
        store.mark_completed(job.id, "worker-0", json!({"rows": 99})).await.unwrap();
        let twice = store.get_job(job.id).await.unwrap().unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.result, Some(json!({"rows": 3})));
        assert!(twice.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_report_from_another_worker_is_refused() {
        let (store, _clock) = store();
        let scheduler = PriorityScheduler::default();
        let job = store
            .enqueue("generate_report", json!({}), &JobOptions::new())
            .await
            .unwrap();
        store
            .claim_ready(&types(&["generate_report"]), &workers(1), &scheduler)
            .await
            .unwrap();

        let err = store
            .mark_completed(job.id, "worker-9", json!({"rows": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StaleClaim { .. }));
        let err = store
            .mark_failed(job.id, "worker-9", "late", &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StaleClaim { .. }));

        let untouched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Processing);
        assert_eq!(untouched.worker_id.as_deref(), Some("worker-0"));
        assert_eq!(untouched.failure_count, 0);
    }

    #[tokio::test]
    async fn test_mark_completed_rejects_pending_job() {
        let (store, _clock) = store();
        let job = store
            .enqueue("generate_report", json!({}), &JobOptions::new())
            .await
            .unwrap();
        let err = store
            .mark_completed(job.id, "worker-0", json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_job_backs_off() {
        let (store, clock) = store();
        let scheduler = PriorityScheduler::default();
        let policy = RetryPolicy::default()
            .with_strategy(RetryStrategy::exponential(
                Duration::from_secs(10),
                2.0,
                Duration::from_secs(300),
            ));
        let job = store
            .enqueue("send_notification", json!({}), &JobOptions::new())
            .await
            .unwrap();
        let claim_types = types(&["send_notification"]);

        store.claim_ready(&claim_types, &workers(1), &scheduler).await.unwrap();
        let decision = store.mark_failed(job.id, "worker-0", "smtp down", &policy).await.unwrap();
        assert!(matches!(decision, FailureDecision::Retry { retry_count: 1, .. }));

        let retried = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.scheduled_at, clock.now() + chrono::Duration::seconds(10));
        assert_eq!(retried.error_message.as_deref(), Some("smtp down"));
        assert!(retried.worker_id.is_none());

        // not claimable until the backoff elapses
        assert!(
            store
                .claim_ready(&claim_types, &workers(1), &scheduler)
                .await
                .unwrap()
                .is_empty()
        );
        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(
            store
                .claim_ready(&claim_types, &workers(1), &scheduler)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (store, _clock) = store();
        let scheduler = PriorityScheduler::default();
        let first = store
            .enqueue("cleanup_data", json!({}), &JobOptions::new())
            .await
            .unwrap();

        let cancelled = store.cancel(first.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(
            store
                .claim_ready(&types(&["cleanup_data"]), &workers(1), &scheduler)
                .await
                .unwrap()
                .is_empty()
        );

        let second = store
            .enqueue("cleanup_data", json!({}), &JobOptions::new())
            .await
            .unwrap();
        store
            .claim_ready(&types(&["cleanup_data"]), &workers(1), &scheduler)
            .await
            .unwrap();
        let err = store.cancel(second.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { action: "cancel", .. }));
    }

    #[tokio::test]
    async fn test_requeue_stale_returns_old_claims() {
        let (store, clock) = store();
        let scheduler = PriorityScheduler::default();
        let job = store
            .enqueue("generate_ai_response", json!({}), &JobOptions::new())
            .await
            .unwrap();
        store
            .claim_ready(&types(&["generate_ai_response"]), &workers(1), &scheduler)
            .await
            .unwrap();

        assert!(store.requeue_stale(Duration::from_secs(600)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::minutes(15));
        let requeued = store.requeue_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(requeued, vec![job.id]);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
        assert_eq!(job.failure_count, 0);
    }

    #[tokio::test]
    async fn test_metrics_window_and_percentiles() {
        let (store, clock) = store();
        let scheduler = PriorityScheduler::default();
        let policy = RetryPolicy::default();
        let claim_types = types(&["generate_report"]);

        for _ in 0..3 {
            store
                .enqueue("generate_report", json!({}), &JobOptions::new())
                .await
                .unwrap();
        }
        let failing = store
            .enqueue(
                "generate_report",
                json!({}),
                &JobOptions::new().with_max_retries(0),
            )
            .await
            .unwrap();
        store
            .enqueue("generate_report", json!({}), &JobOptions::new().with_delay(Duration::from_secs(3600)))
            .await
            .unwrap();

        let claimed = store.claim_ready(&claim_types, &workers(4), &scheduler).await.unwrap();
        assert_eq!(claimed.len(), 4);
        clock.advance(chrono::Duration::milliseconds(200));
        for job in &claimed {
            let worker_id = job.worker_id.as_deref().unwrap();
            if job.id == failing.id {
                store.mark_failed(job.id, worker_id, "boom", &policy).await.unwrap();
            } else {
                store.mark_completed(job.id, worker_id, json!(null)).await.unwrap();
            }
        }

        let metrics = store.metrics(Duration::from_secs(60)).await.unwrap();
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.completed, 3);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.completed_in_window, 3);
        assert_eq!(metrics.failed_in_window, 1);
        assert_eq!(metrics.error_rate, 0.25);
        assert_eq!(metrics.avg_processing_time_ms, 200.0);
        assert_eq!(metrics.p99_processing_time_ms, 200.0);
        assert_eq!(metrics.total(), 5);

        clock.advance(chrono::Duration::minutes(5));
        let later = store.metrics(Duration::from_secs(60)).await.unwrap();
        assert_eq!(later.completed, 3);
        assert_eq!(later.completed_in_window, 0);
        assert_eq!(later.error_rate, 0.0);
    }
}
