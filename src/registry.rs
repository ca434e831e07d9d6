//! Job-type to processor dispatch.
//!
//! Each job type maps to one [`JobProcessor`] plus a concurrency hint. A claimed job
//! whose type has no entry is a first-class [`DispatchError::UnknownJobType`], never a
//! panic.
//!
//! Processors receive a [`JobContext`]. When the worker gives up on a job (timeout or
//! abandonment) the context's [`CancellationSignal`] fires and the spawned task is
//! aborted at its next await point. Work a processor hands off elsewhere (threads,
//! remote calls already in flight) only stops if the processor watches the signal.
//!
//! ```rust
//! use dispatchwork::registry::{ProcessorRegistry, handler_fn};
//! use serde_json::json;
//!
//! let mut registry = ProcessorRegistry::new();
//! registry.register(
//!     "send_notification",
//!     handler_fn(|job, _ctx| async move { Ok(json!({"sent_to": job.payload["to"]})) }),
//!     4,
//! );
//! assert!(registry.contains("send_notification"));
//! assert_eq!(registry.concurrency_of("send_notification"), Some(4));
//! ```

use crate::{
    DispatchError, Result,
    job::{Job, WorkerId},
};
use async_trait::async_trait;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::sync::watch;

#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Runs the job and returns the value stored as its result.
    async fn process(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value>;
}

pub type JobHandler = Arc<dyn JobProcessor>;

/// Adapter turning an async closure into a [`JobProcessor`].
pub struct FnProcessor<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn process(&self, job: Job, ctx: JobContext) -> Result<serde_json::Value> {
        (self.func)(job, ctx).await
    }
}

pub fn handler_fn<F, Fut>(func: F) -> JobHandler
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(FnProcessor { func })
}

/// Read side of a per-job cancellation flag.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
    // sender owned by the signal itself when there is no worker behind it
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the worker abandons the job, or once the worker is done with it.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug)]
pub(crate) struct CancellationTrigger {
    tx: watch::Sender<bool>,
}

impl CancellationTrigger {
    pub(crate) fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub(crate) fn cancellation_pair() -> (CancellationTrigger, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancellationTrigger { tx },
        CancellationSignal {
            rx,
            _keepalive: None,
        },
    )
}

/// Execution context handed to a processor alongside the job.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub worker_id: WorkerId,
    /// 1-based attempt number over the job's whole life.
    pub attempt: i32,
    /// Time budget before the worker gives up, if any.
    pub timeout: Option<Duration>,
    pub cancellation: CancellationSignal,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Context that never cancels, for calling processors outside a pool.
    pub fn detached(worker_id: impl Into<WorkerId>, attempt: i32) -> Self {
        let (tx, rx) = watch::channel(false);
        let cancellation = CancellationSignal {
            rx,
            _keepalive: Some(Arc::new(tx)),
        };
        Self {
            worker_id: worker_id.into(),
            attempt,
            timeout: None,
            cancellation,
        }
    }
}

#[derive(Clone)]
pub struct Registration {
    pub handler: JobHandler,
    /// Soft cap on in-flight jobs of this type across the pool.
    pub concurrency: usize,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[derive(Default, Debug, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `job_type`, replacing any earlier registration.
    /// A concurrency hint of zero is treated as one.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: JobHandler,
        concurrency: usize,
    ) -> Option<Registration> {
        self.processors.insert(
            job_type.into(),
            Registration {
                handler,
                concurrency: concurrency.max(1),
            },
        )
    }

    pub fn unregister(&mut self, job_type: &str) -> Option<Registration> {
        self.processors.remove(job_type)
    }

    pub fn get(&self, job_type: &str) -> Option<&Registration> {
        self.processors.get(job_type)
    }

    pub fn resolve(&self, job_type: &str) -> Result<JobHandler> {
        self.processors
            .get(job_type)
            .map(|registration| Arc::clone(&registration.handler))
            .ok_or_else(|| DispatchError::UnknownJobType {
                job_type: job_type.to_string(),
            })
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.processors.contains_key(job_type)
    }

    pub fn concurrency_of(&self, job_type: &str) -> Option<usize> {
        self.processors.get(job_type).map(|r| r.concurrency)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.processors.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    fn noop() -> JobHandler {
        handler_fn(|_job, _ctx| async { Ok(serde_json::Value::Null) })
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = ProcessorRegistry::new();
        assert!(registry.is_empty());

        assert!(registry.register("create_quote", noop(), 2).is_none());
        assert!(registry.register("create_quote", noop(), 3).is_some());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.concurrency_of("create_quote"), Some(3));
        assert!(registry.resolve("create_quote").is_ok());
    }

    #[test]
    fn test_unknown_job_type_is_an_error() {
        let registry = ProcessorRegistry::new();
        let err = registry.resolve("send_fax").err().unwrap();
        assert!(matches!(err, DispatchError::UnknownJobType { ref job_type } if job_type == "send_fax"));
    }

    #[test]
    fn test_zero_concurrency_becomes_one() {
        let mut registry = ProcessorRegistry::new();
        registry.register("x", noop(), 0);
        assert_eq!(registry.concurrency_of("x"), Some(1));
    }

    #[test]
    fn test_job_types_sorted() {
        let mut registry = ProcessorRegistry::new();
        registry.register("b", noop(), 1);
        registry.register("a", noop(), 1);
        registry.register("c", noop(), 1);
        assert_eq!(registry.job_types(), vec!["a", "b", "c"]);

        registry.unregister("b");
        assert_eq!(registry.job_types(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_fn_processor_receives_job_and_context() {
        let handler = handler_fn(|job, ctx| async move {
            Ok(json!({"type": job.job_type, "worker": ctx.worker_id, "attempt": ctx.attempt}))
        });

        let job = Job::new("create_quote", json!({}), &JobOptions::default(), chrono::Utc::now());
        let out = handler
            .process(job, JobContext::detached("worker-0", 1))
            .await
            .unwrap();
        assert_eq!(out, json!({"type": "create_quote", "worker": "worker-0", "attempt": 1}));
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (trigger, mut signal) = cancellation_pair();
        assert!(!signal.is_cancelled());

        trigger.cancel();
        signal.cancelled().await;
        assert!(signal.is_cancelled());
    }
}
