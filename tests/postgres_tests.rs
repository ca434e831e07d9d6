//! PostgreSQL store tests. They run only when `DATABASE_URL` points at a database.

#![cfg(feature = "postgres")]

use dispatchwork::{
    DispatchError, FailureDecision, JobOptions, JobPriority, JobStatus, JobStore, PostgresJobStore,
    PriorityScheduler, RetryPolicy, RetryStrategy,
};
use serde_json::json;
use std::{collections::HashSet, sync::Arc, time::Duration};

async fn setup_store() -> Option<PostgresJobStore> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres test");
        return None;
    };
    let store = PostgresJobStore::connect(&database_url, 10, Duration::from_secs(10))
        .await
        .expect("Failed to connect to Postgres");
    store.create_tables().await.expect("Failed to create tables");
    Some(store)
}

/// A job type no other test run uses, so tests can share the tables.
fn unique_type(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_postgres_claim_order_and_binding() {
    let Some(store) = setup_store().await else {
        return;
    };
    let job_type = unique_type("send_sms");
    let types = vec![job_type.clone()];

    let low = store
        .enqueue(&job_type, json!({}), &JobOptions::new().with_priority(JobPriority::Low))
        .await
        .unwrap();
    let emergency = store
        .enqueue(
            &job_type,
            json!({}),
            &JobOptions::new().with_priority(JobPriority::Emergency),
        )
        .await
        .unwrap();
    let high = store
        .enqueue(&job_type, json!({}), &JobOptions::new().with_priority(JobPriority::High))
        .await
        .unwrap();

    let workers: Vec<String> = (0..3).map(|i| format!("pg-worker-{}", i)).collect();
    let claimed = store
        .claim_ready(&types, &workers, &PriorityScheduler::default())
        .await
        .unwrap();

    let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![emergency.id, high.id, low.id]);
    for (job, worker) in claimed.iter().zip(&workers) {
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id.as_ref(), Some(worker));
    }
}

#[tokio::test]
async fn test_postgres_concurrent_claims_are_exclusive() {
    let Some(store) = setup_store().await else {
        return;
    };
    let store = Arc::new(store);
    let job_type = unique_type("cleanup_data");
    for n in 0..40 {
        store
            .enqueue(&job_type, json!({"n": n}), &JobOptions::new())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for poller in 0..6 {
        let store = Arc::clone(&store);
        let types = vec![job_type.clone()];
        handles.push(tokio::spawn(async move {
            let workers: Vec<String> = (0..4).map(|w| format!("pg-{}-{}", poller, w)).collect();
            let scheduler = PriorityScheduler::default();
            let mut claimed = Vec::new();
            for _ in 0..50 {
                let batch = store.claim_ready(&types, &workers, &scheduler).await.unwrap();
                if batch.is_empty() && !claimed.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|j| j.id));
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} was claimed twice", id);
        }
    }
    assert!(seen.len() <= 40);
}

#[tokio::test]
async fn test_postgres_failure_lifecycle() {
    let Some(store) = setup_store().await else {
        return;
    };
    let job_type = unique_type("process_payment_event");
    let types = vec![job_type.clone()];
    let workers = vec!["pg-worker".to_string()];
    let scheduler = PriorityScheduler::default();
    let policy = RetryPolicy::new(RetryStrategy::fixed(Duration::from_millis(1)), 2);

    let job = store
        .enqueue(&job_type, json!({"event": "invoice.paid"}), &JobOptions::new().with_max_retries(1))
        .await
        .unwrap();

    store.claim_ready(&types, &workers, &scheduler).await.unwrap();
    let decision = store.mark_failed(job.id, "pg-worker", "gateway timeout", &policy).await.unwrap();
    assert!(matches!(decision, FailureDecision::Exhausted { failure_count: 1, .. }));

    store.resubmit(job.id).await.unwrap();
    let claimed = store.claim_ready(&types, &workers, &scheduler).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let decision = store.mark_failed(job.id, "pg-worker", "gateway timeout", &policy).await.unwrap();
    assert!(decision.is_dead_letter());

    let dead = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(dead.status, JobStatus::Failed);
    assert!(dead.is_dead_lettered());
    assert!(store.resubmit(job.id).await.is_err());

    let records = store.dead_letters(100).await.unwrap();
    let ours: Vec<_> = records.iter().filter(|r| r.job_id == job.id).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].payload, json!({"event": "invoice.paid"}));
}

#[tokio::test]
async fn test_postgres_completion_cancel_and_recovery() {
    let Some(store) = setup_store().await else {
        return;
    };
    let job_type = unique_type("create_quote");
    let types = vec![job_type.clone()];
    let scheduler = PriorityScheduler::default();

    let done = store
        .enqueue(&job_type, json!({}), &JobOptions::new().with_priority(JobPriority::High))
        .await
        .unwrap();
    let stuck = store
        .enqueue(&job_type, json!({}), &JobOptions::new())
        .await
        .unwrap();
    let cancelled = store
        .enqueue(&job_type, json!({}), &JobOptions::new().with_priority(JobPriority::Low))
        .await
        .unwrap();

    store.cancel(cancelled.id).await.unwrap();
    let claimed = store
        .claim_ready(&types, &["a".to_string(), "b".to_string()], &scheduler)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);

    store.mark_completed(done.id, "a", json!({"total": 42})).await.unwrap();
    store.mark_completed(done.id, "a", json!({"total": 43})).await.unwrap();
    let completed = store.get_job(done.id).await.unwrap().unwrap();
    assert_eq!(completed.result, Some(json!({"total": 42})));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let recovered = store.requeue_stale(Duration::from_secs(1)).await.unwrap();
    assert!(recovered.contains(&stuck.id));
    let requeued = store.get_job(stuck.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.worker_id.is_none());

    let reclaimed = store
        .claim_ready(&types, &["c".to_string()], &scheduler)
        .await
        .unwrap();
    assert_eq!(reclaimed[0].id, stuck.id);
    assert!(matches!(
        store.mark_completed(stuck.id, "b", json!({})).await,
        Err(DispatchError::StaleClaim { .. })
    ));
    let policy = RetryPolicy::default();
    assert!(matches!(
        store.mark_failed(stuck.id, "b", "late", &policy).await,
        Err(DispatchError::StaleClaim { .. })
    ));
    let still_claimed = store.get_job(stuck.id).await.unwrap().unwrap();
    assert_eq!(still_claimed.worker_id.as_deref(), Some("c"));
    assert_eq!(still_claimed.failure_count, 0);
    store.mark_completed(stuck.id, "c", json!({})).await.unwrap();

    let metrics = store.metrics(Duration::from_secs(3600)).await.unwrap();
    assert!(metrics.completed >= 1);
    assert!(metrics.cancelled >= 1);
}
