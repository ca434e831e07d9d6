//! Deterministic ranking of ready jobs.
//!
//! Ready jobs are ordered by a three-level key, most significant first:
//!
//! 1. priority tier, `emergency > high > medium > low`
//! 2. job-type weight from the static [`JobTypeWeights`] table
//! 3. `scheduled_at` ascending (FIFO)
//!
//! `created_at` and the job id are used as last resorts so the order is total and
//! repeatable. The ordering only holds among jobs visible at the same poll tick.

use crate::{
    job::{Job, JobId},
    priority::{JobPriority, JobTypeWeights},
};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};

/// Sort key for a job. Smaller keys are dispatched first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DispatchKey {
    priority: Reverse<JobPriority>,
    type_weight: Reverse<i32>,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    id: JobId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityScheduler {
    weights: JobTypeWeights,
}

impl PriorityScheduler {
    pub fn new(weights: JobTypeWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &JobTypeWeights {
        &self.weights
    }

    pub fn dispatch_key(&self, job: &Job) -> DispatchKey {
        DispatchKey {
            priority: Reverse(job.priority),
            type_weight: Reverse(self.weights.weight_of(&job.job_type)),
            scheduled_at: job.scheduled_at,
            created_at: job.created_at,
            id: job.id,
        }
    }

    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        self.dispatch_key(a).cmp(&self.dispatch_key(b))
    }

    /// Sorts `jobs` into dispatch order.
    pub fn rank(&self, jobs: &mut [Job]) {
        jobs.sort_by_cached_key(|job| self.dispatch_key(job));
    }

    /// Picks up to `limit` jobs that are `pending`, due at `now` and of one of
    /// `job_types`, in dispatch order.
    pub fn select_ready<'a, I>(
        &self,
        jobs: I,
        job_types: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<JobId>
    where
        I: IntoIterator<Item = &'a Job>,
    {
        if limit == 0 || job_types.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<DispatchKey> = jobs
            .into_iter()
            .filter(|job| job.is_ready(now))
            .filter(|job| job_types.iter().any(|t| *t == job.job_type))
            .map(|job| self.dispatch_key(job))
            .collect();

        candidates.sort_unstable();
        candidates.truncate(limit);
        candidates.into_iter().map(|key| key.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobOptions, JobStatus};
    use serde_json::json;

    fn job(job_type: &str, priority: JobPriority, scheduled_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            job_type,
            json!({}),
            &JobOptions::new().with_priority(priority),
            scheduled_at,
        );
        job.scheduled_at = scheduled_at;
        job
    }

    fn types(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_priority_tier_dominates() {
        let scheduler = PriorityScheduler::default();
        let now = Utc::now();

        let low = job("notify_emergency", JobPriority::Low, now);
        let high = job("cleanup_data", JobPriority::High, now);
        let emergency = job("cleanup_data", JobPriority::Emergency, now);

        let mut jobs = vec![low.clone(), high.clone(), emergency.clone()];
        scheduler.rank(&mut jobs);

        let order: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![emergency.id, high.id, low.id]);
    }

    #[test]
    fn test_type_weight_breaks_ties_within_tier() {
        let scheduler = PriorityScheduler::default();
        let now = Utc::now();

        let cleanup = job("cleanup_data", JobPriority::Medium, now - chrono::Duration::hours(1));
        let ai = job("generate_ai_response", JobPriority::Medium, now);
        let notify = job("notify_emergency", JobPriority::Medium, now);

        let mut jobs = vec![cleanup.clone(), ai.clone(), notify.clone()];
        scheduler.rank(&mut jobs);

        assert_eq!(jobs[0].id, notify.id);
        assert_eq!(jobs[1].id, ai.id);
        assert_eq!(jobs[2].id, cleanup.id);
    }

    #[test]
    fn test_fifo_within_same_tier_and_weight() {
        let scheduler = PriorityScheduler::default();
        let now = Utc::now();

        let later = job("create_quote", JobPriority::High, now);
        let earlier = job("create_quote", JobPriority::High, now - chrono::Duration::seconds(5));

        assert_eq!(scheduler.compare(&earlier, &later), Ordering::Less);
        assert_eq!(scheduler.compare(&later, &earlier), Ordering::Greater);
    }

    #[test]
    fn test_select_ready_filters_and_limits() {
        let scheduler = PriorityScheduler::new(JobTypeWeights::empty());
        let now = Utc::now();

        let due = job("a", JobPriority::Medium, now - chrono::Duration::seconds(1));
        let future = job("a", JobPriority::Emergency, now + chrono::Duration::seconds(30));
        let other_type = job("b", JobPriority::Emergency, now);
        let mut processing = job("a", JobPriority::High, now);
        processing.status = JobStatus::Processing;
        let urgent = job("a", JobPriority::High, now);

        let jobs = vec![due.clone(), future, other_type, processing, urgent.clone()];

        let selected = scheduler.select_ready(&jobs, &types(&["a"]), now, 10);
        assert_eq!(selected, vec![urgent.id, due.id]);

        let limited = scheduler.select_ready(&jobs, &types(&["a"]), now, 1);
        assert_eq!(limited, vec![urgent.id]);

        assert!(scheduler.select_ready(&jobs, &types(&["a"]), now, 0).is_empty());
        assert!(scheduler.select_ready(&jobs, &[], now, 5).is_empty());
    }
}
