//! Prometheus metrics for the queue and worker pool.
//!
//! The collector is always available; without the `metrics` feature it is a no-op with
//! the same API so callers never need to feature-gate.

use crate::{Result, config::MetricsConfig, priority::JobPriority, queue::QueueMetrics, stats::JobEvent};

#[cfg(feature = "metrics")]
use crate::{DispatchError, job::JobStatus, stats::JobEventType};
#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::{net::SocketAddr, sync::Mutex};
#[cfg(feature = "metrics")]
use tracing::{error, info};
#[cfg(feature = "metrics")]
use warp::Filter;

/// Prometheus metrics collector for queue and job metrics
#[cfg(feature = "metrics")]
pub struct PrometheusMetricsCollector {
    config: MetricsConfig,
    registry: Registry,
    jobs_total: CounterVec,
    job_duration: HistogramVec,
    job_failures_total: CounterVec,
    jobs_enqueued_total: CounterVec,
    queue_jobs: GaugeVec,
    queue_error_rate: Gauge,
    workers: GaugeVec,
    server: Mutex<Option<(SocketAddr, tokio::task::JoinHandle<()>)>>,
}

#[cfg(feature = "metrics")]
fn metrics_error(what: &str, e: prometheus::Error) -> DispatchError {
    DispatchError::Metrics {
        message: format!("Failed to {}: {}", what, e),
    }
}

#[cfg(feature = "metrics")]
fn register<M>(registry: &Registry, metric: M, name: &str) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| metrics_error(&format!("register {} with registry", name), e))?;
    Ok(metric)
}

#[cfg(feature = "metrics")]
impl PrometheusMetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let ns = config.namespace.as_str();

        let jobs_total = CounterVec::new(
            prometheus::Opts::new(format!("{}_jobs_total", ns), "Job outcomes by type"),
            &["job_type", "outcome", "priority"],
        )
        .map_err(|e| metrics_error("create jobs_total metric", e))?;

        let job_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                format!("{}_job_duration_seconds", ns),
                "Processor execution time in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["job_type", "priority"],
        )
        .map_err(|e| metrics_error("create job_duration metric", e))?;

        let job_failures_total = CounterVec::new(
            prometheus::Opts::new(
                format!("{}_job_failures_total", ns),
                "Failed attempts by failure kind",
            ),
            &["job_type", "kind"],
        )
        .map_err(|e| metrics_error("create job_failures_total metric", e))?;

        let jobs_enqueued_total = CounterVec::new(
            prometheus::Opts::new(
                format!("{}_jobs_enqueued_total", ns),
                "Jobs accepted by add_job",
            ),
            &["job_type", "priority"],
        )
        .map_err(|e| metrics_error("create jobs_enqueued_total metric", e))?;

        let queue_jobs = GaugeVec::new(
            prometheus::Opts::new(format!("{}_queue_jobs", ns), "Jobs in the store by status"),
            &["status"],
        )
        .map_err(|e| metrics_error("create queue_jobs metric", e))?;

        let queue_error_rate = Gauge::new(
            format!("{}_queue_error_rate", ns),
            "failed / (completed + failed) over the metrics window",
        )
        .map_err(|e| metrics_error("create queue_error_rate metric", e))?;

        let workers = GaugeVec::new(
            prometheus::Opts::new(format!("{}_workers", ns), "Worker slots by status"),
            &["status"],
        )
        .map_err(|e| metrics_error("create workers metric", e))?;

        Ok(Self {
            jobs_total: register(&registry, jobs_total, "jobs_total")?,
            job_duration: register(&registry, job_duration, "job_duration")?,
            job_failures_total: register(&registry, job_failures_total, "job_failures_total")?,
            jobs_enqueued_total: register(&registry, jobs_enqueued_total, "jobs_enqueued_total")?,
            queue_jobs: register(&registry, queue_jobs, "queue_jobs")?,
            queue_error_rate: register(&registry, queue_error_rate, "queue_error_rate")?,
            workers: register(&registry, workers, "workers")?,
            config: config.clone(),
            registry,
            server: Mutex::new(None),
        })
    }

    /// Serves `/metrics` on the configured bind address.
    ///
    /// Returns the bound address, or `None` when no address is configured. Binding to
    /// port 0 picks a free port. Calling it again while the server runs returns the
    /// address it already listens on.
    pub fn start_exposition_server(&self) -> Result<Option<SocketAddr>> {
        let Some(bind_address) = self.config.bind_address.as_deref() else {
            return Ok(None);
        };
        let mut server = self.server.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((bound, handle)) = server.as_ref() {
            if !handle.is_finished() {
                return Ok(Some(*bound));
            }
        }
        let addr: SocketAddr = bind_address.parse().map_err(|e| {
            DispatchError::Config(format!("invalid metrics bind address '{}': {}", bind_address, e))
        })?;

        let registry = self.registry.clone();
        let route = warp::path("metrics")
            .and(warp::get())
            .map(move || match encode(&registry) {
                Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
                Err(e) => {
                    error!(error = %e, "failed to encode metrics");
                    warp::reply::with_status(
                        String::new(),
                        warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            })
            .with(warp::reply::with::header(
                "content-type",
                "text/plain; version=0.0.4",
            ));

        let (bound, serve) = warp::serve(route)
            .try_bind_ephemeral(addr)
            .map_err(|e| DispatchError::Metrics {
                message: format!("Failed to bind metrics server on {}: {}", addr, e),
            })?;

        *server = Some((bound, tokio::spawn(serve)));
        info!(address = %bound, "metrics exposition server listening");
        Ok(Some(bound))
    }

    /// Address of the running exposition server, if any.
    pub fn server_address(&self) -> Option<SocketAddr> {
        let server = self.server.lock().unwrap_or_else(|e| e.into_inner());
        server
            .as_ref()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(bound, _)| *bound)
    }

    pub fn record_job_event(&self, event: &JobEvent) {
        let job_type = event.job_type.as_str();
        let priority = event.priority.to_string();

        let outcome = match event.event_type {
            JobEventType::Started => "started",
            JobEventType::Completed => "completed",
            JobEventType::Retried => "retried",
            JobEventType::Failed => "failed",
            JobEventType::DeadLettered => "dead_lettered",
        };
        self.jobs_total
            .with_label_values(&[job_type, outcome, priority.as_str()])
            .inc();

        if event.event_type == JobEventType::Completed {
            if let Some(duration_ms) = event.processing_time_ms {
                self.job_duration
                    .with_label_values(&[job_type, priority.as_str()])
                    .observe(duration_ms as f64 / 1000.0);
            }
        }

        if let Some(kind) = event.failure_kind {
            self.job_failures_total
                .with_label_values(&[job_type, kind.as_str()])
                .inc();
        }
    }

    pub fn record_enqueued(&self, job_type: &str, priority: JobPriority) {
        let priority = priority.to_string();
        self.jobs_enqueued_total
            .with_label_values(&[job_type, priority.as_str()])
            .inc();
    }

    pub fn update_queue_metrics(&self, metrics: &QueueMetrics) {
        for status in JobStatus::all() {
            self.queue_jobs
                .with_label_values(&[status.as_str()])
                .set(metrics.count(status) as f64);
        }
        self.queue_jobs
            .with_label_values(&["dead_lettered"])
            .set(metrics.dead_lettered as f64);
        self.queue_error_rate.set(metrics.error_rate);
    }

    pub fn set_workers(&self, status: &str, count: usize) {
        self.workers.with_label_values(&[status]).set(count as f64);
    }

    /// Current metrics in the Prometheus text format.
    pub fn get_metrics_text(&self) -> Result<String> {
        encode(&self.registry)
    }
}

#[cfg(feature = "metrics")]
fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| metrics_error("encode metrics", e))?;

    String::from_utf8(buffer).map_err(|e| DispatchError::Metrics {
        message: format!("Failed to convert metrics to string: {}", e),
    })
}

#[cfg(feature = "metrics")]
impl Drop for PrometheusMetricsCollector {
    fn drop(&mut self) {
        let server = self.server.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = server.take() {
            handle.abort();
        }
    }
}

/// No-op metrics collector when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct PrometheusMetricsCollector {
    _config: MetricsConfig,
}

#[cfg(not(feature = "metrics"))]
impl PrometheusMetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        Ok(Self {
            _config: config.clone(),
        })
    }

    pub fn start_exposition_server(&self) -> Result<Option<std::net::SocketAddr>> {
        Ok(None)
    }

    pub fn server_address(&self) -> Option<std::net::SocketAddr> {
        None
    }

    pub fn record_job_event(&self, _event: &JobEvent) {}

    pub fn record_enqueued(&self, _job_type: &str, _priority: JobPriority) {}

    pub fn update_queue_metrics(&self, _metrics: &QueueMetrics) {}

    pub fn set_workers(&self, _status: &str, _count: usize) {}

    pub fn get_metrics_text(&self) -> Result<String> {
        Ok("# Metrics collection disabled\n".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FailureKind, JobEventType};
    use std::time::Duration;

    fn event(event_type: JobEventType, failure_kind: Option<FailureKind>) -> JobEvent {
        JobEvent {
            job_id: uuid::Uuid::new_v4(),
            job_type: "send_email".to_string(),
            event_type,
            priority: JobPriority::High,
            worker_id: Some("worker-0".to_string()),
            failure_kind,
            processing_time_ms: Some(1500),
            error_message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_job_events_are_exported() {
        let collector = PrometheusMetricsCollector::new(&MetricsConfig::default()).unwrap();
        collector.record_job_event(&event(JobEventType::Completed, None));
        collector.record_job_event(&event(JobEventType::Retried, Some(FailureKind::Timeout)));

        let text = collector.get_metrics_text().unwrap();
        assert!(text.contains(
            "dispatchwork_jobs_total{job_type=\"send_email\",outcome=\"completed\",priority=\"high\"} 1"
        ));
        assert!(text.contains(
            "dispatchwork_job_failures_total{job_type=\"send_email\",kind=\"timeout\"} 1"
        ));
        assert!(text.contains("dispatchwork_job_duration_seconds_count"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_queue_snapshot_sets_gauges() {
        let config = MetricsConfig {
            namespace: "billing".to_string(),
            ..Default::default()
        };
        let collector = PrometheusMetricsCollector::new(&config).unwrap();

        let mut snapshot = QueueMetrics::empty(Duration::from_secs(3600), chrono::Utc::now())
            .with_window_outcomes(3, 1);
        snapshot.pending = 7;
        collector.update_queue_metrics(&snapshot);
        collector.record_enqueued("create_quote", JobPriority::Emergency);
        collector.set_workers("idle", 4);

        let text = collector.get_metrics_text().unwrap();
        assert!(text.contains("billing_queue_jobs{status=\"pending\"} 7"));
        assert!(text.contains("billing_queue_error_rate 0.25"));
        assert!(text.contains(
            "billing_jobs_enqueued_total{job_type=\"create_quote\",priority=\"emergency\"} 1"
        ));
        assert!(text.contains("billing_workers{status=\"idle\"} 4"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_exposition_server_binds_only_when_configured() {
        let collector = PrometheusMetricsCollector::new(&MetricsConfig::default()).unwrap();
        assert_eq!(collector.start_exposition_server().unwrap(), None);

        let config = MetricsConfig {
            enabled: true,
            bind_address: Some("127.0.0.1:0".to_string()),
            ..Default::default()
        };
        let collector = PrometheusMetricsCollector::new(&config).unwrap();
        let bound = collector.start_exposition_server().unwrap().unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(collector.start_exposition_server().unwrap(), Some(bound));
        assert_eq!(collector.server_address(), Some(bound));
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_noop_collector() {
        let collector = PrometheusMetricsCollector::new(&MetricsConfig::default()).unwrap();
        collector.record_job_event(&event(JobEventType::Failed, Some(FailureKind::Error)));

        let text = collector.get_metrics_text().unwrap();
        assert!(text.contains("disabled"));
    }
}
