//! Configuration for the job store, worker pool, retry policy and logging.
//!
//! A [`DispatchConfig`] can be built in code, loaded from a TOML file or read from
//! `DISPATCHWORK_*` environment variables. Durations are written human-readably
//! (`"500ms"`, `"30s"`, `"5m"`, `"1h"`).
//!
//! ```rust
//! use dispatchwork::config::DispatchConfig;
//! use std::time::Duration;
//!
//! let config = DispatchConfig::new()
//!     .with_database_url("postgresql://localhost/dispatch")
//!     .with_worker_pool_size(8)
//!     .with_job_timeout(Duration::from_secs(120));
//! assert!(config.validate().is_ok());
//! ```

use crate::{
    DispatchError, Result,
    job::DEFAULT_MAX_RETRIES,
    priority::JobTypeWeights,
    retry::{RetryPolicy, RetryStrategy},
};
use serde::{Deserialize, Serialize};
use std::{path::Path, str::FromStr, time::Duration};

/// Serde helpers for `std::time::Duration` as strings like `"250ms"`, `"30s"`, `"5m"`.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() != 0 {
            return format!("{}ms", duration.as_millis());
        }
        let secs = duration.as_secs();
        if secs == 0 {
            "0s".to_string()
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parses `"30s"`, `"5m"`, `"1h"`, `"2d"`, `"250ms"` or a bare number of seconds.
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("Invalid number in duration: {}", millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let secs = match suffix {
            "s" => Some(num),
            "m" => num.checked_mul(60),
            "h" => num.checked_mul(3600),
            "d" => num.checked_mul(86400),
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };
        secs.map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    }
}

/// Parses a duration written the way configuration files write them.
///
/// ```rust
/// use dispatchwork::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
/// assert!(parse_duration("soon").is_err());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    duration_str::parse_duration(s).map_err(DispatchError::Config)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    /// Job-type weights used to break ties inside a priority tier
    pub priority: JobTypeWeights,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker.pool_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.worker.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.worker.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.worker.shutdown_timeout = timeout;
        self
    }

    pub fn with_job_types(mut self, job_types: Vec<String>) -> Self {
        self.worker.job_types = Some(job_types);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry.strategy = strategy;
        self
    }

    pub fn with_dead_letter_threshold(mut self, threshold: i32) -> Self {
        self.retry.dead_letter_threshold = threshold;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.retry.default_max_retries = max_retries;
        self
    }

    pub fn with_priority_weights(mut self, weights: JobTypeWeights) -> Self {
        self.priority = weights;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Defaults overridden by `DISPATCHWORK_*` environment variables.
    ///
    /// A variable that is set but cannot be parsed is a configuration error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DISPATCHWORK_DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(pool_size) = env_parse("DISPATCHWORK_DATABASE_POOL_SIZE")? {
            config.database.pool_size = pool_size;
        }

        if let Some(pool_size) = env_parse("DISPATCHWORK_WORKER_POOL_SIZE")? {
            config.worker.pool_size = pool_size;
        }
        if let Some(interval) = env_duration("DISPATCHWORK_POLL_INTERVAL")? {
            config.worker.poll_interval = interval;
        }
        if let Some(seconds) = env_parse::<u64>("DISPATCHWORK_JOB_TIMEOUT_SECONDS")? {
            config.worker.job_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse::<u64>("DISPATCHWORK_SHUTDOWN_TIMEOUT_SECONDS")? {
            config.worker.shutdown_timeout = Duration::from_secs(seconds);
        }
        if let Ok(types) = std::env::var("DISPATCHWORK_JOB_TYPES") {
            let types: Vec<String> = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            config.worker.job_types = (!types.is_empty()).then_some(types);
        }

        if let Some(max_retries) = env_parse("DISPATCHWORK_MAX_RETRIES")? {
            config.retry.default_max_retries = max_retries;
        }
        if let Some(threshold) = env_parse("DISPATCHWORK_DEAD_LETTER_THRESHOLD")? {
            config.retry.dead_letter_threshold = threshold;
        }

        if let Ok(level) = std::env::var("DISPATCHWORK_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Checks the settings a worker pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            return Err(DispatchError::Config(
                "worker.pool_size must be greater than 0".to_string(),
            ));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(DispatchError::Config(
                "worker.poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.worker.job_timeout.is_zero() {
            return Err(DispatchError::Config(
                "worker.job_timeout must be greater than 0".to_string(),
            ));
        }
        if self.database.pool_size == 0 {
            return Err(DispatchError::Config(
                "database.pool_size must be greater than 0".to_string(),
            ));
        }
        self.retry.validate()?;

        if self.metrics.enabled {
            if let Some(addr) = &self.metrics.bind_address {
                addr.parse::<std::net::SocketAddr>().map_err(|e| {
                    DispatchError::Config(format!(
                        "metrics.bind_address '{}' is not a socket address: {}",
                        addr, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Configuration for local development
    pub fn development() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/dispatchwork_dev".to_string(),
                pool_size: 5,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 2,
                poll_interval: Duration::from_millis(100),
                shutdown_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                include_location: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Configuration for production use
    pub fn production() -> Self {
        Self {
            database: DatabaseConfig {
                pool_size: 20,
                connection_timeout_secs: 60,
                create_tables: false,
                ..Default::default()
            },
            worker: WorkerConfig {
                pool_size: 8,
                poll_interval: Duration::from_secs(1),
                job_timeout: Duration::from_secs(600),
                shutdown_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            retry: RetryConfig {
                dead_letter_threshold: 10,
                ..Default::default()
            },
            metrics: MetricsConfig {
                enabled: true,
                bind_address: Some("0.0.0.0:9090".to_string()),
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_format: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<T>().map(Some).map_err(|e| {
            DispatchError::Config(format!("invalid value '{}' for {}: {}", value, name, e))
        }),
        Err(_) => Ok(None),
    }
}

fn env_duration(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => duration_str::parse_duration(&value)
            .map(Some)
            .map_err(|e| DispatchError::Config(format!("invalid value for {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Connection pool size
    pub pool_size: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Whether to create tables if they don't exist
    pub create_tables: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/dispatchwork".to_string(),
            pool_size: 10,
            connection_timeout_secs: 30,
            create_tables: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker slots, fixed for the life of the pool
    pub pool_size: usize,

    /// Fallback interval of the shared poll loop
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// Deadline for a single processor invocation
    #[serde(with = "duration_str")]
    pub job_timeout: Duration,

    /// How long `stop()` waits for in-flight jobs
    #[serde(with = "duration_str")]
    pub shutdown_timeout: Duration,

    /// Window used by `get_metrics()`
    #[serde(with = "duration_str")]
    pub metrics_window: Duration,

    /// Job types this pool claims. `None` means every registered type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_types: Option<Vec<String>>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            metrics_window: Duration::from_secs(3600),
            job_types: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry budget for jobs enqueued without an explicit `max_retries`
    pub default_max_retries: i32,

    /// Cumulative failures after which a job is dead-lettered
    pub dead_letter_threshold: i32,

    pub strategy: RetryStrategy,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.strategy.clone(), self.dead_letter_threshold)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy().validate(self.default_max_retries)?;

        match &self.strategy {
            RetryStrategy::Fixed { .. } => {}
            RetryStrategy::Linear { base, max_delay, .. } => {
                if base > max_delay {
                    return Err(DispatchError::Config(format!(
                        "retry base delay {:?} exceeds max delay {:?}",
                        base, max_delay
                    )));
                }
            }
            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                ..
            } => {
                if base > max_delay {
                    return Err(DispatchError::Config(format!(
                        "retry base delay {:?} exceeds max delay {:?}",
                        base, max_delay
                    )));
                }
                if !multiplier.is_finite() || *multiplier < 1.0 {
                    return Err(DispatchError::Config(format!(
                        "retry multiplier must be at least 1.0, got {}",
                        multiplier
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            dead_letter_threshold: policy.dead_letter_threshold,
            strategy: policy.strategy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to collect Prometheus metrics
    pub enabled: bool,

    /// Prefix for every exported metric name
    pub namespace: String,

    /// Address for the HTTP exposition endpoint; no server when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "dispatchwork".to_string(),
            bind_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,

    /// Whether to enable structured JSON logging
    pub json_format: bool,

    /// Whether to include file and line information
    pub include_location: bool,

    /// Service name attached to every log line
    pub service_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
            service_name: "dispatchwork".to_string(),
        }
    }
}
