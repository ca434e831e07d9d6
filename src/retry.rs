//! Retry backoff and dead-letter decisions.
//!
//! Every failed attempt goes through [`RetryPolicy::decide`], which picks exactly one of
//! three outcomes:
//!
//! 1. **Dead-letter**: the job's cumulative `failure_count` reached the policy's
//!    dead-letter threshold. A [`DeadLetterRecord`](crate::DeadLetterRecord) is written
//!    and the job stays `failed` for good.
//! 2. **Retry**: the job still has retry budget (`retry_count < max_retries` after
//!    counting this failure). It goes back to `pending` with `scheduled_at` pushed out by
//!    the strategy's backoff.
//! 3. **Exhausted**: no budget left. The job is `failed`, but it can still be resubmitted
//!    externally, and further failures keep counting toward the dead-letter threshold.
//!
//! The threshold is checked first, so a threshold lower than a job's retry budget would
//! quarantine it early; [`RetryPolicy::validate`] rejects such configurations.
//!
//! # Examples
//!
//! ```rust
//! use dispatchwork::retry::RetryStrategy;
//! use std::time::Duration;
//!
//! // 1s, 2s, 4s, 8s ... capped at 10 minutes
//! let strategy = RetryStrategy::exponential(
//!     Duration::from_secs(1),
//!     2.0,
//!     Duration::from_secs(10 * 60),
//! );
//! assert_eq!(strategy.calculate_delay(1), Duration::from_secs(1));
//! assert_eq!(strategy.calculate_delay(4), Duration::from_secs(8));
//! assert_eq!(strategy.calculate_delay(30), Duration::from_secs(600));
//! ```

use crate::{
    DispatchError, Result,
    config::duration_str,
    job::{DEFAULT_MAX_RETRIES, Job},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Randomisation applied on top of a computed delay.
///
/// Spreads out retries of jobs that failed together. Jittered delays are not
/// guaranteed to be monotonic across attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JitterType {
    /// `delay ± rand(0, amount)`
    Additive(#[serde(with = "duration_str")] Duration),

    /// `delay * (1 ± rand(0, factor))`
    Multiplicative(f64),
}

impl JitterType {
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        match self {
            JitterType::Additive(jitter_amount) => {
                let jitter_millis = rng.gen_range(0..=jitter_amount.as_millis() as u64);
                let jitter = Duration::from_millis(jitter_millis);

                if rng.gen_bool(0.5) {
                    delay + jitter
                } else {
                    delay.saturating_sub(jitter)
                }
            }
            JitterType::Multiplicative(factor) => {
                let factor = factor.clamp(0.0, 1.0);
                let jitter_factor = rng.gen_range((1.0 - factor)..=(1.0 + factor));
                let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
                Duration::from_millis(jittered_millis)
            }
        }
    }
}

/// Backoff curve used to space out retries.
///
/// `attempt` is 1-based: the first retry is attempt 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay every time.
    Fixed {
        #[serde(with = "duration_str")]
        delay: Duration,
    },

    /// `base + attempt * increment`, capped.
    Linear {
        #[serde(with = "duration_str")]
        base: Duration,
        #[serde(with = "duration_str")]
        increment: Duration,
        #[serde(with = "duration_str")]
        max_delay: Duration,
    },

    /// `base * multiplier^(attempt - 1)`, capped, with optional jitter.
    Exponential {
        #[serde(with = "duration_str")]
        base: Duration,
        multiplier: f64,
        #[serde(with = "duration_str")]
        max_delay: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<JitterType>,
    },
}

impl RetryStrategy {
    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Fixed { delay }
    }

    pub fn linear(base: Duration, increment: Duration, max_delay: Duration) -> Self {
        RetryStrategy::Linear {
            base,
            increment,
            max_delay,
        }
    }

    pub fn exponential(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: None,
        }
    }

    pub fn exponential_with_jitter(
        base: Duration,
        multiplier: f64,
        max_delay: Duration,
        jitter: JitterType,
    ) -> Self {
        RetryStrategy::Exponential {
            base,
            multiplier,
            max_delay,
            jitter: Some(jitter),
        }
    }

    /// Delay before retry number `attempt` (1-based). Never below 1ms.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self {
            RetryStrategy::Fixed { delay } => *delay,

            RetryStrategy::Linear {
                base,
                increment,
                max_delay,
            } => (*base + increment.saturating_mul(attempt)).min(*max_delay),

            RetryStrategy::Exponential {
                base,
                multiplier,
                max_delay,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exponent);
                // mul_f64 panics on overflow or non-finite input, so cap in f64 first
                let capped = if !factor.is_finite()
                    || base.as_secs_f64() * factor >= max_delay.as_secs_f64()
                {
                    *max_delay
                } else {
                    base.mul_f64(factor.max(0.0))
                };

                match jitter {
                    Some(jitter) => jitter.apply(capped),
                    None => capped,
                }
            }
        };

        delay.max(Duration::from_millis(1))
    }

    pub fn max_delay(&self) -> Duration {
        match self {
            RetryStrategy::Fixed { delay } => *delay,
            RetryStrategy::Linear { max_delay, .. } | RetryStrategy::Exponential { max_delay, .. } => {
                *max_delay
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::exponential(Duration::from_secs(1), 2.0, Duration::from_secs(300))
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDecision {
    /// Back to `pending` at `scheduled_at`.
    Retry {
        retry_count: i32,
        failure_count: i32,
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// `failed`, retry budget spent; can still be resubmitted.
    Exhausted { retry_count: i32, failure_count: i32 },
    /// `failed` for good, with a dead-letter record.
    DeadLetter { retry_count: i32, failure_count: i32 },
}

impl FailureDecision {
    pub fn failure_count(&self) -> i32 {
        match self {
            FailureDecision::Retry { failure_count, .. }
            | FailureDecision::Exhausted { failure_count, .. }
            | FailureDecision::DeadLetter { failure_count, .. } => *failure_count,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self, FailureDecision::DeadLetter { .. })
    }
}

/// Retry cadence plus the dead-letter safety net.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    /// Cumulative failures after which a job is quarantined.
    pub dead_letter_threshold: i32,
}

impl RetryPolicy {
    pub const DEFAULT_DEAD_LETTER_THRESHOLD: i32 = 5;

    pub fn new(strategy: RetryStrategy, dead_letter_threshold: i32) -> Self {
        Self {
            strategy,
            dead_letter_threshold,
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_dead_letter_threshold(mut self, threshold: i32) -> Self {
        self.dead_letter_threshold = threshold;
        self
    }

    /// Rejects a threshold that would quarantine jobs before `max_retries` is spent.
    pub fn validate(&self, max_retries: i32) -> Result<()> {
        if self.dead_letter_threshold < 1 {
            return Err(DispatchError::Config(format!(
                "dead_letter_threshold must be at least 1, got {}",
                self.dead_letter_threshold
            )));
        }
        if max_retries < 0 {
            return Err(DispatchError::Config(format!(
                "max_retries must not be negative, got {}",
                max_retries
            )));
        }
        if self.dead_letter_threshold < max_retries {
            return Err(DispatchError::Config(format!(
                "dead_letter_threshold ({}) is lower than max_retries ({}); jobs would be \
                 dead-lettered before their retry budget is exhausted",
                self.dead_letter_threshold, max_retries
            )));
        }
        Ok(())
    }

    /// Decides the outcome of one more failure of `job`, evaluated at `now`.
    ///
    /// `job` is the state before the failure is counted.
    pub fn decide(&self, job: &Job, now: DateTime<Utc>) -> FailureDecision {
        let failure_count = job.failure_count.saturating_add(1);
        let retry_count = job.retry_count.saturating_add(1);

        if failure_count >= self.dead_letter_threshold {
            return FailureDecision::DeadLetter {
                retry_count: retry_count.min(job.max_retries.max(job.retry_count)),
                failure_count,
            };
        }

        if retry_count < job.max_retries {
            let delay = self.strategy.calculate_delay(retry_count as u32);
            let scheduled_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            return FailureDecision::Retry {
                retry_count,
                failure_count,
                delay,
                scheduled_at,
            };
        }

        FailureDecision::Exhausted {
            retry_count: retry_count.min(job.max_retries.max(job.retry_count)),
            failure_count,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            dead_letter_threshold: Self::DEFAULT_DEAD_LETTER_THRESHOLD.max(DEFAULT_MAX_RETRIES),
        }
    }
}
