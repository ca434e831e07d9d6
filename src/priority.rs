//! Business priority tiers and the static job-type weight table.
//!
//! Jobs are ranked on two independent axes before their schedule time is considered:
//!
//! - **Priority tier**: the business urgency chosen by the producer
//!   (`emergency > high > medium > low`).
//! - **Job-type weight**: a static number attached to each job type, used only to break
//!   ties *within* a tier. Operationally critical types such as `notify_emergency` jump
//!   ahead of lower-value work like `cleanup_data` even when both are `medium`.
//!
//! ## Priority Levels
//!
//! - **Emergency (3)**: burst pipes, outage alerts, anything a human must see now
//! - **High (2)**: customer-facing replies, payment confirmations
//! - **Medium (1)**: standard processing (default)
//! - **Low (0)**: reporting, cleanup, housekeeping

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Business urgency of a job, independent of its job type.
///
/// # Examples
///
/// ```rust
/// use dispatchwork::JobPriority;
/// use std::str::FromStr;
///
/// let priority = JobPriority::from_str("emergency").unwrap();
/// assert_eq!(priority, JobPriority::Emergency);
/// assert_eq!(priority.as_i32(), 3);
///
/// assert!(JobPriority::Emergency > JobPriority::High);
/// assert!(JobPriority::High > JobPriority::Medium);
/// assert!(JobPriority::Medium > JobPriority::Low);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Work that can wait indefinitely without anyone noticing.
    Low = 0,

    /// The default tier for routine traffic.
    #[default]
    Medium = 1,

    /// Customer-facing work that should not queue behind routine jobs.
    High = 2,

    /// Processed before everything else.
    ///
    /// Reserve for genuinely urgent traffic; a flood of emergency jobs starves every
    /// other tier for as long as it lasts.
    Emergency = 3,
}

impl JobPriority {
    /// Numeric value used for storage and SQL ordering.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Parses a stored numeric value.
    ///
    /// ```rust
    /// use dispatchwork::JobPriority;
    ///
    /// assert_eq!(JobPriority::from_i32(0).unwrap(), JobPriority::Low);
    /// assert_eq!(JobPriority::from_i32(3).unwrap(), JobPriority::Emergency);
    /// assert!(JobPriority::from_i32(7).is_err());
    /// ```
    pub fn from_i32(value: i32) -> Result<Self, PriorityError> {
        match value {
            0 => Ok(JobPriority::Low),
            1 => Ok(JobPriority::Medium),
            2 => Ok(JobPriority::High),
            3 => Ok(JobPriority::Emergency),
            _ => Err(PriorityError::InvalidPriorityValue(value)),
        }
    }

    /// All tiers from lowest to highest.
    pub fn all_priorities() -> Vec<JobPriority> {
        vec![
            JobPriority::Low,
            JobPriority::Medium,
            JobPriority::High,
            JobPriority::Emergency,
        ]
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Medium => write!(f, "medium"),
            JobPriority::High => write!(f, "high"),
            JobPriority::Emergency => write!(f, "emergency"),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = PriorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "l" => Ok(JobPriority::Low),
            "medium" | "normal" | "m" | "default" => Ok(JobPriority::Medium),
            "high" | "h" => Ok(JobPriority::High),
            "emergency" | "urgent" | "e" => Ok(JobPriority::Emergency),
            _ => Err(PriorityError::InvalidPriorityString(s.to_string())),
        }
    }
}

/// Static per-job-type weights used to break ties within a priority tier.
///
/// Higher weights are dispatched first. Types missing from the table get the
/// default weight.
///
/// # Examples
///
/// ```rust
/// use dispatchwork::JobTypeWeights;
///
/// let weights = JobTypeWeights::new();
/// assert!(weights.weight_of("notify_emergency") > weights.weight_of("generate_ai_response"));
/// assert!(weights.weight_of("generate_ai_response") > weights.weight_of("cleanup_data"));
///
/// let custom = JobTypeWeights::empty()
///     .with_weight("sync_calendar", 40)
///     .with_default_weight(5);
/// assert_eq!(custom.weight_of("sync_calendar"), 40);
/// assert_eq!(custom.weight_of("anything_else"), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTypeWeights {
    #[serde(default)]
    weights: HashMap<String, i32>,
    #[serde(default = "default_type_weight")]
    default_weight: i32,
}

fn default_type_weight() -> i32 {
    JobTypeWeights::DEFAULT_WEIGHT
}

impl JobTypeWeights {
    /// Weight for job types that are not listed in the table.
    pub const DEFAULT_WEIGHT: i32 = 50;

    /// The built-in table for the webhook-driven job types of the platform.
    pub fn new() -> Self {
        Self::empty()
            .with_weight("notify_emergency", 100)
            .with_weight("process_payment_event", 90)
            .with_weight("send_notification", 80)
            .with_weight("generate_ai_response", 70)
            .with_weight("create_quote", 60)
            .with_weight("sync_calendar_event", 55)
            .with_weight("schedule_follow_up", 40)
            .with_weight("generate_report", 20)
            .with_weight("cleanup_data", 10)
    }

    /// A table with no entries; every type gets the default weight.
    pub fn empty() -> Self {
        Self {
            weights: HashMap::new(),
            default_weight: Self::DEFAULT_WEIGHT,
        }
    }

    pub fn with_weight(mut self, job_type: impl Into<String>, weight: i32) -> Self {
        self.weights.insert(job_type.into(), weight);
        self
    }

    pub fn with_weights(mut self, weights: HashMap<String, i32>) -> Self {
        self.weights.extend(weights);
        self
    }

    pub fn with_default_weight(mut self, weight: i32) -> Self {
        self.default_weight = weight;
        self
    }

    pub fn weight_of(&self, job_type: &str) -> i32 {
        self.weights
            .get(job_type)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn default_weight(&self) -> i32 {
        self.default_weight
    }

    pub fn weights(&self) -> &HashMap<String, i32> {
        &self.weights
    }
}

impl Default for JobTypeWeights {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors related to priority handling
#[derive(Error, Debug, PartialEq)]
pub enum PriorityError {
    #[error("Invalid priority value: {0}. Must be between 0 and 3")]
    InvalidPriorityValue(i32),

    #[error("Invalid priority string: '{0}'. Valid values are: low, medium, high, emergency")]
    InvalidPriorityString(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_priority_ordering() {
        assert!(JobPriority::Emergency > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Medium);
        assert!(JobPriority::Medium > JobPriority::Low);
        assert_eq!(JobPriority::default(), JobPriority::Medium);
    }

    #[test]
    fn test_job_priority_conversion() {
        for priority in JobPriority::all_priorities() {
            assert_eq!(JobPriority::from_i32(priority.as_i32()).unwrap(), priority);
        }
        assert_eq!(
            JobPriority::from_i32(10),
            Err(PriorityError::InvalidPriorityValue(10))
        );
    }

    #[test]
    fn test_job_priority_string_parsing() {
        assert_eq!("high".parse::<JobPriority>().unwrap(), JobPriority::High);
        assert_eq!("NORMAL".parse::<JobPriority>().unwrap(), JobPriority::Medium);
        assert_eq!(
            "urgent".parse::<JobPriority>().unwrap(),
            JobPriority::Emergency
        );
        assert!("critical-ish".parse::<JobPriority>().is_err());
    }

    #[test]
    fn test_priority_display() {
        assert_eq!(JobPriority::Emergency.to_string(), "emergency");
        assert_eq!(JobPriority::Medium.to_string(), "medium");
        assert_eq!(JobPriority::Low.to_string(), "low");
    }

    #[test]
    fn test_priority_serde_uses_snake_case() {
        let json = serde_json::to_string(&JobPriority::Emergency).unwrap();
        assert_eq!(json, "\"emergency\"");
        let parsed: JobPriority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, JobPriority::Low);
    }

    #[test]
    fn test_default_type_weights() {
        let weights = JobTypeWeights::new();
        assert_eq!(weights.weight_of("notify_emergency"), 100);
        assert_eq!(weights.weight_of("cleanup_data"), 10);
        assert_eq!(
            weights.weight_of("unknown_type"),
            JobTypeWeights::DEFAULT_WEIGHT
        );
    }

    #[test]
    fn test_custom_type_weights() {
        let mut extra = HashMap::new();
        extra.insert("a".to_string(), 1);
        extra.insert("b".to_string(), 2);

        let weights = JobTypeWeights::empty()
            .with_weights(extra)
            .with_default_weight(0);
        assert_eq!(weights.weight_of("b"), 2);
        assert_eq!(weights.weight_of("c"), 0);
        assert_eq!(weights.weights().len(), 2);
    }
}
