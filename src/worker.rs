//! Bounded worker pool with a single shared poll loop.
//!
//! `start()` creates N idle worker slots and spawns one poll loop. Each tick the loop
//! counts idle slots, asks the store for that many ready jobs (one atomic claim, each
//! job bound to one idle slot) and spawns one execution task per claimed job. The loop
//! wakes on its interval or immediately when a producer enqueues a job.
//!
//! An execution task runs the registered processor in its own tokio task under the
//! worker timeout. Whatever happens (success, error, timeout, panic, missing
//! processor) the outcome is reported to the store and the slot goes back to idle.
//! On timeout the job's cancellation signal fires and the processor task is aborted;
//! work the processor started outside its own task only stops if it watches the
//! signal.
//!
//! `stop()` halts the poll loop first, then waits up to the shutdown timeout for
//! in-flight jobs. Jobs still running when the timeout elapses stay `processing` in
//! the store until their task reports or a `requeue_stale` sweep picks them up.

use crate::{
    DispatchError, Result,
    config::WorkerConfig,
    job::{Job, JobId, WorkerId},
    metrics::PrometheusMetricsCollector,
    queue::JobStore,
    registry::{JobContext, ProcessorRegistry, cancellation_pair},
    retry::{FailureDecision, RetryPolicy},
    scheduler::PriorityScheduler,
    stats::{FailureKind, JobEvent, JobEventType, StatisticsCollector},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tokio::{
    sync::{Mutex, Notify, RwLock, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

/// Snapshot of one worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_job_id: Option<JobId>,
    pub current_job_type: Option<String>,
    /// Jobs this slot has finished, whatever the outcome
    pub processed_count: u64,
    pub last_activity_at: DateTime<Utc>,
}

impl WorkerInfo {
    fn idle(id: WorkerId) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            current_job_id: None,
            current_job_type: None,
            processed_count: 0,
            last_activity_at: Utc::now(),
        }
    }
}

/// State shared by the poll loop and every execution task of one run.
struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<ProcessorRegistry>>,
    scheduler: PriorityScheduler,
    policy: RetryPolicy,
    settings: WorkerConfig,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    metrics_collector: Option<Arc<PrometheusMetricsCollector>>,
    slots: RwLock<Vec<WorkerInfo>>,
    active: watch::Sender<usize>,
    /// Set once `stop()` has begun; finished slots then go to `Stopped`, not `Idle`.
    stopping: AtomicBool,
}

struct Run {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    registry: Arc<RwLock<ProcessorRegistry>>,
    scheduler: PriorityScheduler,
    policy: RetryPolicy,
    settings: WorkerConfig,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    metrics_collector: Option<Arc<PrometheusMetricsCollector>>,
    wakeup: Arc<Notify>,
    run: Mutex<Option<Run>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<RwLock<ProcessorRegistry>>,
        settings: WorkerConfig,
        scheduler: PriorityScheduler,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            policy,
            settings,
            stats_collector: None,
            metrics_collector: None,
            wakeup: Arc::new(Notify::new()),
            run: Mutex::new(None),
        }
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    pub fn with_metrics_collector(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics_collector = Some(metrics);
        self
    }

    /// Runs the next poll tick now instead of at the next interval.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub async fn is_running(&self) -> bool {
        self.run
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| run.poll_handle.is_some())
    }

    /// Worker slots of the current or last run. Empty before the first start.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let dispatcher = match self.run.lock().await.as_ref() {
            Some(run) => Arc::clone(&run.dispatcher),
            None => return Vec::new(),
        };
        let slots = dispatcher.slots.read().await;
        slots.clone()
    }

    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| r.poll_handle.is_some()) {
            warn!("worker pool is already running");
            return Ok(());
        }
        check_settings(&self.settings)?;

        // fresh ids per run so late reports from an earlier run never touch these slots
        let run_tag = Uuid::new_v4().simple().to_string();
        let slots = (0..self.settings.pool_size)
            .map(|i| WorkerInfo::idle(format!("worker-{}-{}", &run_tag[..8], i)))
            .collect();

        let (active, _) = watch::channel(0usize);
        let dispatcher = Arc::new(Dispatcher {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            scheduler: self.scheduler.clone(),
            policy: self.policy.clone(),
            settings: self.settings.clone(),
            stats_collector: self.stats_collector.clone(),
            metrics_collector: self.metrics_collector.clone(),
            slots: RwLock::new(slots),
            active,
            stopping: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll_handle = tokio::spawn(Arc::clone(&dispatcher).poll_loop(
            shutdown_rx,
            Arc::clone(&self.wakeup),
        ));

        info!(
            pool_size = self.settings.pool_size,
            poll_interval = ?self.settings.poll_interval,
            job_timeout = ?self.settings.job_timeout,
            "worker pool started"
        );
        dispatcher.report_worker_gauges().await;

        *run = Some(Run {
            dispatcher,
            shutdown_tx,
            poll_handle: Some(poll_handle),
        });
        Ok(())
    }

    /// Stops claiming, then waits up to the shutdown timeout for in-flight jobs.
    ///
    /// Returns as soon as the last in-flight job finishes. Elapsing the timeout is
    /// logged as a warning, not returned as an error.
    pub async fn stop(&self) -> Result<()> {
        let (dispatcher, poll_handle) = {
            let mut run = self.run.lock().await;
            let Some(run) = run.as_mut() else {
                debug!("worker pool was never started");
                return Ok(());
            };
            let Some(handle) = run.poll_handle.take() else {
                debug!("worker pool is already stopped");
                return Ok(());
            };
            let _ = run.shutdown_tx.send(true);
            run.dispatcher.stopping.store(true, Ordering::SeqCst);
            (Arc::clone(&run.dispatcher), handle)
        };

        let timeout = self.settings.shutdown_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        info!(?timeout, "stopping worker pool");

        if let Err(e) = tokio::time::timeout_at(deadline, poll_handle).await.unwrap_or(Ok(())) {
            error!(error = %e, "poll loop terminated abnormally");
        }

        let mut active_rx = dispatcher.active.subscribe();
        let drained = tokio::time::timeout_at(deadline, active_rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if drained {
            info!("worker pool stopped");
        } else {
            let in_flight = *dispatcher.active.borrow();
            warn!(
                in_flight,
                ?timeout,
                "shutdown timeout elapsed with jobs still in flight; they stay processing until they report or are requeued"
            );
        }

        dispatcher.mark_idle_stopped().await;
        dispatcher.report_worker_gauges().await;
        Ok(())
    }
}

fn check_settings(settings: &WorkerConfig) -> Result<()> {
    let problem = if settings.pool_size == 0 {
        "pool size must be greater than 0"
    } else if settings.poll_interval.is_zero() {
        "poll interval must be greater than 0"
    } else if settings.job_timeout.is_zero() {
        "job timeout must be greater than 0"
    } else {
        return Ok(());
    };
    Err(DispatchError::Worker {
        message: problem.to_string(),
    })
}

impl Dispatcher {
    async fn poll_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>, wakeup: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {}
                _ = wakeup.notified() => {}
            }
            if *shutdown_rx.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(0) => {}
                Ok(claimed) => debug!(claimed, "claimed jobs"),
                // the tick is abandoned; the next one retries
                Err(e) => error!(error = %e, "failed to claim jobs"),
            }
        }
        debug!("poll loop exited");
    }

    /// One claim round. Returns how many jobs were dispatched.
    async fn poll_once(self: &Arc<Self>) -> Result<usize> {
        let (idle, in_flight) = {
            let slots = self.slots.read().await;
            let idle: Vec<WorkerId> = slots
                .iter()
                .filter(|slot| slot.status == WorkerStatus::Idle)
                .map(|slot| slot.id.clone())
                .collect();
            let mut in_flight: HashMap<String, usize> = HashMap::new();
            for job_type in slots.iter().filter_map(|slot| slot.current_job_type.as_ref()) {
                *in_flight.entry(job_type.clone()).or_insert(0) += 1;
            }
            (idle, in_flight)
        };
        if idle.is_empty() {
            return Ok(0);
        }

        let job_types = self.claimable_types(&in_flight).await;
        if job_types.is_empty() {
            return Ok(0);
        }

        let claimed = self
            .store
            .claim_ready(&job_types, &idle, &self.scheduler)
            .await?;
        let count = claimed.len();

        for job in claimed {
            let Some(worker_id) = job.worker_id.clone() else {
                error!(job_id = %job.id, "store returned a claimed job without a worker id");
                continue;
            };
            self.assign(&worker_id, &job).await;
            self.active.send_modify(|n| *n += 1);

            let dispatcher = Arc::clone(self);
            tokio::spawn(async move { dispatcher.execute(worker_id, job).await });
        }

        if count > 0 {
            self.report_worker_gauges().await;
        }
        Ok(count)
    }

    /// Subscribed job types minus those already at their concurrency hint.
    async fn claimable_types(&self, in_flight: &HashMap<String, usize>) -> Vec<String> {
        let registry = self.registry.read().await;
        let subscribed = match &self.settings.job_types {
            Some(types) => types.clone(),
            None => registry.job_types(),
        };

        subscribed
            .into_iter()
            .filter(|job_type| match registry.concurrency_of(job_type) {
                Some(cap) => in_flight.get(job_type).copied().unwrap_or(0) < cap,
                None => true,
            })
            .collect()
    }

    async fn assign(&self, worker_id: &WorkerId, job: &Job) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.iter_mut().find(|slot| &slot.id == worker_id) {
            slot.status = WorkerStatus::Processing;
            slot.current_job_id = Some(job.id);
            slot.current_job_type = Some(job.job_type.clone());
            slot.last_activity_at = Utc::now();
        }
    }

    async fn release(&self, worker_id: &WorkerId) {
        let mut slots = self.slots.write().await;
        let status = if self.stopping.load(Ordering::SeqCst) {
            WorkerStatus::Stopped
        } else {
            WorkerStatus::Idle
        };
        if let Some(slot) = slots.iter_mut().find(|slot| &slot.id == worker_id) {
            slot.status = status;
            slot.current_job_id = None;
            slot.current_job_type = None;
            slot.processed_count += 1;
            slot.last_activity_at = Utc::now();
        }
    }

    async fn mark_idle_stopped(&self) {
        let mut slots = self.slots.write().await;
        for slot in slots.iter_mut().filter(|s| s.status == WorkerStatus::Idle) {
            slot.status = WorkerStatus::Stopped;
        }
    }

    async fn execute(self: Arc<Self>, worker_id: WorkerId, job: Job) {
        let started = Instant::now();
        debug!(job_id = %job.id, job_type = %job.job_type, worker_id = %worker_id, "processing job");
        self.record_event(&job, &worker_id, JobEventType::Started, None, None, None)
            .await;

        let outcome = self.run_processor(&worker_id, job.clone()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => self.complete(&worker_id, &job, result, elapsed_ms).await,
            Err((error, kind)) => self.fail(&worker_id, &job, error, kind, elapsed_ms).await,
        }

        self.release(&worker_id).await;
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        self.report_worker_gauges().await;
    }

    async fn run_processor(
        &self,
        worker_id: &WorkerId,
        job: Job,
    ) -> std::result::Result<serde_json::Value, (DispatchError, FailureKind)> {
        let handler = match self.registry.read().await.resolve(&job.job_type) {
            Ok(handler) => handler,
            Err(e) => return Err((e, FailureKind::UnknownJobType)),
        };

        let job_id = job.id;
        let timeout = self.settings.job_timeout;
        let (trigger, signal) = cancellation_pair();
        let ctx = JobContext {
            worker_id: worker_id.clone(),
            attempt: job.failure_count.saturating_add(1),
            timeout: Some(timeout),
            cancellation: signal,
        };

        let mut task = tokio::spawn(async move { handler.process(job, ctx).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err((e, FailureKind::Error)),
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(job_id = %job_id, panic_msg = %message, "processor panicked");
                Err((
                    DispatchError::Processing(format!("processor panicked: {}", message)),
                    FailureKind::Panic,
                ))
            }
            Ok(Err(join_error)) => Err((
                DispatchError::Processing(format!("processor task was cancelled: {}", join_error)),
                FailureKind::Error,
            )),
            Err(_elapsed) => {
                trigger.cancel();
                task.abort();
                Err((
                    DispatchError::Timeout {
                        job_id: job_id.to_string(),
                        timeout,
                    },
                    FailureKind::Timeout,
                ))
            }
        }
    }

    async fn complete(
        &self,
        worker_id: &WorkerId,
        job: &Job,
        result: serde_json::Value,
        elapsed_ms: u64,
    ) {
        match self.store.mark_completed(job.id, worker_id, result).await {
            Ok(()) => {
                debug!(job_id = %job.id, worker_id = %worker_id, elapsed_ms, "job completed");
                self.record_event(
                    job,
                    worker_id,
                    JobEventType::Completed,
                    None,
                    Some(elapsed_ms),
                    None,
                )
                .await;
            }
            Err(e @ DispatchError::StaleClaim { .. }) => warn!(
                job_id = %job.id,
                worker_id = %worker_id,
                error = %e,
                "dropped completion from a worker that lost its claim"
            ),
            Err(e) => error!(
                job_id = %job.id,
                worker_id = %worker_id,
                error = %e,
                "failed to record job completion"
            ),
        }
    }

    async fn fail(
        &self,
        worker_id: &WorkerId,
        job: &Job,
        error: DispatchError,
        kind: FailureKind,
        elapsed_ms: u64,
    ) {
        let message = error.to_string();
        let decision = match self
            .store
            .mark_failed(job.id, worker_id, &message, &self.policy)
            .await
        {
            Ok(decision) => decision,
            Err(e @ DispatchError::StaleClaim { .. }) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %worker_id,
                    error = %e,
                    cause = %message,
                    "dropped failure from a worker that lost its claim"
                );
                return;
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    worker_id = %worker_id,
                    error = %e,
                    cause = %message,
                    "failed to record job failure; job stays processing until requeued"
                );
                return;
            }
        };

        let event_type = match &decision {
            FailureDecision::Retry {
                retry_count, delay, ..
            } => {
                if error.is_configuration_error() {
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        retry_count,
                        ?delay,
                        error = %message,
                        "job failed with a configuration error, retry scheduled"
                    );
                } else {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        retry_count,
                        ?delay,
                        kind = kind.as_str(),
                        error = %message,
                        "job failed, retry scheduled"
                    );
                }
                JobEventType::Retried
            }
            FailureDecision::Exhausted {
                retry_count,
                failure_count,
            } => {
                if error.is_configuration_error() {
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        retry_count,
                        failure_count,
                        error = %message,
                        "job failed with a configuration error, retry budget exhausted"
                    );
                } else {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        retry_count,
                        failure_count,
                        error = %message,
                        "job failed, retry budget exhausted"
                    );
                }
                JobEventType::Failed
            }
            FailureDecision::DeadLetter { failure_count, .. } => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    failure_count,
                    error = %message,
                    "job dead-lettered"
                );
                JobEventType::DeadLettered
            }
        };

        self.record_event(
            job,
            worker_id,
            event_type,
            Some(kind),
            Some(elapsed_ms),
            Some(message),
        )
        .await;
    }

    async fn record_event(
        &self,
        job: &Job,
        worker_id: &WorkerId,
        event_type: JobEventType,
        failure_kind: Option<FailureKind>,
        processing_time_ms: Option<u64>,
        error_message: Option<String>,
    ) {
        let event = JobEvent {
            job_id: job.id,
            job_type: job.job_type.clone(),
            event_type,
            priority: job.priority,
            worker_id: Some(worker_id.clone()),
            failure_kind,
            processing_time_ms,
            error_message,
            timestamp: Utc::now(),
        };

        if let Some(metrics) = &self.metrics_collector {
            metrics.record_job_event(&event);
        }
        if let Some(stats_collector) = &self.stats_collector {
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }

    async fn report_worker_gauges(&self) {
        let Some(metrics) = &self.metrics_collector else {
            return;
        };
        let slots = self.slots.read().await;
        let mut counts: HashMap<WorkerStatus, usize> = HashMap::new();
        for slot in slots.iter() {
            *counts.entry(slot.status).or_insert(0) += 1;
        }
        for status in [WorkerStatus::Idle, WorkerStatus::Processing, WorkerStatus::Stopped] {
            metrics.set_workers(status.as_str(), counts.get(&status).copied().unwrap_or(0));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
