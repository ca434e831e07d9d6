use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No processor registered for job type '{job_type}'")]
    UnknownJobType { job_type: String },

    #[error("Job {job_id} timed out after {timeout:?}")]
    Timeout { job_id: String, timeout: Duration },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Cannot {action} job {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: String,
        action: &'static str,
    },

    #[error("Job {id} is no longer claimed by worker {worker_id}")]
    StaleClaim { id: String, worker_id: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Whether retrying the job can plausibly succeed.
    ///
    /// A missing processor is a deployment inconsistency: retries still happen,
    /// but they are logged at a higher level because they cannot self-heal.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            DispatchError::UnknownJobType { .. } | DispatchError::Config(_)
        )
    }
}

impl From<toml::de::Error> for DispatchError {
    fn from(err: toml::de::Error) -> Self {
        DispatchError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for DispatchError {
    fn from(err: toml::ser::Error) -> Self {
        DispatchError::Config(format!("TOML serialization error: {}", err))
    }
}
