//! # Dispatchwork
//!
//! A background job queue with a bounded worker pool: producers enqueue typed jobs with
//! a priority and optional delay, workers claim them in priority order and run the
//! processor registered for the job type, failures are retried with backoff and jobs
//! that keep failing are quarantined in a dead-letter record.
//!
//! ## Features
//!
//! - **Priority scheduling**: four tiers, with per-job-type weights breaking ties inside a tier
//! - **At-most-one claim**: a job is only ever bound to one worker at a time
//! - **Retry backoff**: fixed, linear or exponential delays with optional jitter
//! - **Dead letters**: a failure threshold after which a job is parked for good
//! - **Graceful shutdown**: stop claiming, then drain in-flight work within a deadline
//! - **Storage**: an in-memory store, or PostgreSQL with the `postgres` feature
//! - **Monitoring**: Prometheus metrics (`metrics` feature, enabled by default) and
//!   in-process statistics
//!
//! ## Quick Start
//!
//! ```rust
//! use dispatchwork::{
//!     DispatchConfig, JobOptions, JobPriority, JobQueue, JobStatus,
//!     queue::memory::MemoryJobStore, registry::handler_fn,
//! };
//! use serde_json::json;
//! use std::{sync::Arc, time::Duration};
//!
//! # #[tokio::main]
//! # async fn main() -> dispatchwork::Result<()> {
//! let config = DispatchConfig::new()
//!     .with_worker_pool_size(2)
//!     .with_poll_interval(Duration::from_millis(50));
//! let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), config)?;
//!
//! queue
//!     .register_processor(
//!         "send_email",
//!         handler_fn(|job, _ctx| async move { Ok(json!({"sent_to": job.payload["to"]})) }),
//!         2,
//!     )
//!     .await;
//! queue.start().await?;
//!
//! let job = queue
//!     .add_job(
//!         "send_email",
//!         json!({"to": "ops@example.com"}),
//!         JobOptions::new().with_priority(JobPriority::High),
//!     )
//!     .await?;
//!
//! while queue.get_job(job.id).await?.map(|j| j.status) != Some(JobStatus::Completed) {
//!     tokio::time::sleep(Duration::from_millis(10)).await;
//! }
//! queue.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] carries a job type, an opaque JSON payload, a [`JobPriority`] and its retry
//! bookkeeping. It moves `pending → processing → completed | failed | pending` and can
//! be `cancelled` while still pending. `retry_count` is the per-run retry budget;
//! `failure_count` counts every failure over the job's whole life and drives
//! dead-lettering.
//!
//! ### Stores
//!
//! A [`JobStore`] owns all job state. Every transition is one store call, so the
//! claim step can be atomic. See [`queue::memory::MemoryJobStore`] and, with the
//! `postgres` feature, `queue::postgres::PostgresJobStore`.
//!
//! ### Workers
//!
//! The [`WorkerPool`] runs N worker slots off a single poll loop. Each tick claims at
//! most one job per idle worker, in the order defined by [`PriorityScheduler`].
//!
//! ### Retries and dead letters
//!
//! [`RetryPolicy`] decides what a failure means: another attempt after a
//! [`RetryStrategy`] delay, a retry-exhausted `failed` job that an operator may
//! [resubmit](JobQueue::resubmit), or a dead-lettered job that stays failed.

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod metrics;
pub mod priority;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{
    DatabaseConfig, DispatchConfig, LoggingConfig, MetricsConfig, RetryConfig, WorkerConfig,
};
pub use error::DispatchError;
pub use job::{DEFAULT_MAX_RETRIES, DeadLetterRecord, Job, JobId, JobOptions, JobStatus, WorkerId};
pub use logging::init_logging;
pub use metrics::PrometheusMetricsCollector;
pub use priority::{JobPriority, JobTypeWeights};
pub use queue::{JobQueue, JobStore, QueueMetrics};
pub use registry::{
    CancellationSignal, JobContext, JobHandler, JobProcessor, ProcessorRegistry, handler_fn,
};
pub use retry::{FailureDecision, JitterType, RetryPolicy, RetryStrategy};
pub use scheduler::PriorityScheduler;
pub use stats::{
    FailureKind, InMemoryStatsCollector, JobEvent, JobEventType, JobStatistics,
    StatisticsCollector,
};
pub use worker::{WorkerInfo, WorkerPool, WorkerStatus};

#[cfg(feature = "postgres")]
pub use queue::postgres::PostgresJobStore;

/// Result type alias for dispatchwork operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
