//! Runtime counters fed by the worker pool.
//!
//! The store answers "how many jobs are in each state"; the collector answers "what
//! happened recently": how many attempts timed out, how many hit an unregistered job
//! type, how long processors took. Events are kept in memory for a bounded window.

use crate::{
    clock::window_start,
    job::{JobId, WorkerId},
    priority::JobPriority,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

/// Statistics for job processing over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Attempts that reached an outcome in the window
    pub total_processed: u64,
    pub started: u64,
    pub completed: u64,
    /// Failed attempts that were rescheduled
    pub retried: u64,
    /// Failed attempts that exhausted the retry budget
    pub failed: u64,
    pub dead_lettered: u64,
    /// Failed attempts caused by the worker timeout
    pub timed_out: u64,
    /// Failed attempts caused by a missing processor
    pub unknown_job_type: u64,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    pub throughput_per_minute: f64,
    /// Failed attempts / (completed + failed attempts)
    pub error_rate: f64,
    /// Attempts per priority tier
    pub by_priority: HashMap<JobPriority, u64>,
    pub time_window: Duration,
    pub calculated_at: DateTime<Utc>,
}

impl Default for JobStatistics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            started: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            dead_lettered: 0,
            timed_out: 0,
            unknown_job_type: 0,
            avg_processing_time_ms: 0.0,
            min_processing_time_ms: 0,
            max_processing_time_ms: 0,
            throughput_per_minute: 0.0,
            error_rate: 0.0,
            by_priority: HashMap::new(),
            time_window: Duration::from_secs(60),
            calculated_at: Utc::now(),
        }
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The processor returned an error
    Error,
    Timeout,
    UnknownJobType,
    Panic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::UnknownJobType => "unknown_job_type",
            FailureKind::Panic => "panic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEventType {
    Started,
    Completed,
    Retried,
    Failed,
    DeadLettered,
}

/// Job processing event for statistics collection
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub event_type: JobEventType,
    pub priority: JobPriority,
    pub worker_id: Option<WorkerId>,
    pub failure_kind: Option<FailureKind>,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn is_attempt_failure(&self) -> bool {
        matches!(
            self.event_type,
            JobEventType::Retried | JobEventType::Failed | JobEventType::DeadLettered
        )
    }
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    async fn get_job_type_statistics(
        &self,
        job_type: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;

    /// Drops events older than `older_than`; returns how many were removed.
    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64>;
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
    /// Maximum age of events to keep (in seconds)
    pub max_event_age_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_event_age_secs: 3600,
        }
    }
}

/// In-memory statistics collector with time-windowed data
pub struct InMemoryStatsCollector {
    events: Arc<RwLock<Vec<JobEvent>>>,
    config: StatsConfig,
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            config,
        }
    }

    pub fn new_default() -> Self {
        Self::new(StatsConfig::default())
    }

    fn filter_events<F>(&self, window: Duration, predicate: F) -> Vec<JobEvent>
    where
        F: Fn(&JobEvent) -> bool,
    {
        let cutoff = window_start(Utc::now(), window);
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .filter(|event| event.timestamp >= cutoff && predicate(event))
            .cloned()
            .collect()
    }

    fn calculate_statistics(&self, events: &[JobEvent], window: Duration) -> JobStatistics {
        let count = |event_type: JobEventType| {
            events.iter().filter(|e| e.event_type == event_type).count() as u64
        };
        let count_kind = |kind: FailureKind| {
            events
                .iter()
                .filter(|e| e.failure_kind == Some(kind))
                .count() as u64
        };

        let started = count(JobEventType::Started);
        let completed = count(JobEventType::Completed);
        let retried = count(JobEventType::Retried);
        let failed = count(JobEventType::Failed);
        let dead_lettered = count(JobEventType::DeadLettered);
        let attempt_failures = events.iter().filter(|e| e.is_attempt_failure()).count() as u64;
        let total_processed = completed + attempt_failures;

        let processing_times: Vec<u64> =
            events.iter().filter_map(|e| e.processing_time_ms).collect();
        let (avg_processing_time_ms, min_processing_time_ms, max_processing_time_ms) =
            match (processing_times.iter().min(), processing_times.iter().max()) {
                (Some(min), Some(max)) => {
                    let sum: u64 = processing_times.iter().sum();
                    (sum as f64 / processing_times.len() as f64, *min, *max)
                }
                _ => (0.0, 0, 0),
            };

        let error_rate = if total_processed > 0 {
            attempt_failures as f64 / total_processed as f64
        } else {
            0.0
        };

        let throughput_per_minute = if window.as_secs() > 0 {
            total_processed as f64 * 60.0 / window.as_secs() as f64
        } else {
            0.0
        };

        let mut by_priority = HashMap::new();
        for event in events.iter().filter(|e| e.event_type != JobEventType::Started) {
            *by_priority.entry(event.priority).or_insert(0) += 1;
        }

        JobStatistics {
            total_processed,
            started,
            completed,
            retried,
            failed,
            dead_lettered,
            timed_out: count_kind(FailureKind::Timeout),
            unknown_job_type: count_kind(FailureKind::UnknownJobType),
            avg_processing_time_ms,
            min_processing_time_ms,
            max_processing_time_ms,
            throughput_per_minute,
            error_rate,
            by_priority,
            time_window: window,
            calculated_at: Utc::now(),
        }
    }

    /// Clean up events older than `max_event_age_secs` and beyond `max_events`.
    pub fn cleanup_old_events(&self) -> usize {
        let cutoff = window_start(Utc::now(), Duration::from_secs(self.config.max_event_age_secs));
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
        original_len - events.len()
    }
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        events.push(event);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
        Ok(())
    }

    async fn get_job_type_statistics(
        &self,
        job_type: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        let events = self.filter_events(window, |e| e.job_type == job_type);
        Ok(self.calculate_statistics(&events, window))
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        let events = self.filter_events(window, |_| true);
        Ok(self.calculate_statistics(&events, window))
    }

    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64> {
        let cutoff = window_start(Utc::now(), older_than);
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        let before = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
