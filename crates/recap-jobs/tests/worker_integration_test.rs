//! End-to-end tests for workers: execution, retries, timeouts and ordering.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{eventually, item_job, payload, test_config, wait_for_status, MockOps};
use recap_jobs::{
    Error, ErrorCategory, Job, JobKind, JobPriority, JobService, JobStatus, RetryPolicy,
    SchedulerConfig, WorkerConfig,
};

fn fast_retries(service: &JobService, category: ErrorCategory, max_retries: u32) {
    service.errors().update_retry_policy(
        category,
        RetryPolicy::new(max_retries, 0.01, 0.05, 2.0).without_jitter(),
    );
}

#[tokio::test]
async fn test_item_job_completes_and_caches_result() {
    let ops = Arc::new(MockOps::new());
    let service = JobService::new(test_config(2), ops.clone()).await;
    service.start().await;

    let (accepted, message) = service
        .submit_job(item_job("job-1", "item:abc", JobPriority::High), Some("10.0.0.1"))
        .await;
    assert!(accepted, "{message}");

    let record = wait_for_status(&service, "job-1", JobStatus::Completed).await;
    assert_eq!(record.progress, 1.0);
    assert_eq!(record.client_id.as_deref(), Some("10.0.0.1"));
    assert!(record.worker_id.is_some());
    assert!(record.completed_at.is_some());

    let result = record.result.unwrap();
    assert_eq!(result["item_id"], "abc");
    assert_eq!(result["title"], "Video abc");
    assert_eq!(result["cached"], false);
    assert_eq!(ops.saved_entries(), 1);

    let stats = service.workers().stats().await;
    assert_eq!(stats.total_jobs_processed, 1);
    assert_eq!(stats.total_jobs_failed, 0);

    service.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let ops = Arc::new(MockOps::new().failing(
        "flaky",
        vec![
            Error::Network("connection reset by peer".into()),
            Error::Network("connection refused".into()),
        ],
    ));
    let service = JobService::new(test_config(1), ops.clone()).await;
    fast_retries(&service, ErrorCategory::Network, 5);

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    service
        .scheduler()
        .add_completion_callback(move |job: &Job, result| {
            sink.lock()
                .unwrap()
                .push((job.status, result.error_category.clone()));
        });

    service.start().await;
    service
        .submit_job(item_job("retry-me", "item:flaky", JobPriority::Medium), None)
        .await;

    let record = wait_for_status(&service, "retry-me", JobStatus::Completed).await;
    assert_eq!(record.retry_count, 2);
    assert_eq!(ops.content_fetches.load(std::sync::atomic::Ordering::SeqCst), 3);

    eventually(|| outcomes.lock().unwrap().len() == 3).await;
    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(
        outcomes,
        vec![
            (JobStatus::Retry, Some("network".to_string())),
            (JobStatus::Retry, Some("network".to_string())),
            (JobStatus::Completed, None),
        ]
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_retries_stop_at_job_max_retries() {
    let errors = (0..10)
        .map(|_| Error::Network("network unreachable".into()))
        .collect();
    let ops = Arc::new(MockOps::new().failing("down", errors));
    let service = JobService::new(test_config(1), ops).await;
    fast_retries(&service, ErrorCategory::Network, 5);
    service.start().await;

    let job = item_job("doomed", "item:down", JobPriority::Medium).with_max_retries(2);
    service.submit_job(job, None).await;

    let record = wait_for_status(&service, "doomed", JobStatus::Failed).await;
    assert_eq!(record.retry_count, 2);
    assert!(record.error_message.unwrap().contains("unreachable"));

    let stats = service.errors().get_statistics();
    assert_eq!(stats.total_errors, 3);
    assert_eq!(stats.by_category.get(&ErrorCategory::Network), Some(&3));

    service.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors_fail_without_retry() {
    let service = JobService::new(test_config(1), Arc::new(MockOps::new())).await;
    service.start().await;

    service
        .submit_job(item_job("bad", "not-an-item", JobPriority::Low), None)
        .await;
    let missing_input = Job::with_id("empty", JobKind::Item, payload(json!({})), JobPriority::Low);
    service.submit_job(missing_input, None).await;

    for id in ["bad", "empty"] {
        let record = wait_for_status(&service, id, JobStatus::Failed).await;
        assert_eq!(record.retry_count, 0);
    }

    service.shutdown().await;
}

#[tokio::test]
async fn test_job_timeout_is_classified_as_timeout() {
    let ops = Arc::new(MockOps::new().with_content_delay(Duration::from_secs(5)));
    let mut config = test_config(1);
    config.workers = WorkerConfig::default()
        .with_worker_count(1)
        .with_dequeue_timeout(Duration::from_millis(20))
        .with_job_timeout(Duration::from_millis(50));
    let service = JobService::new(config, ops).await;
    service.start().await;

    let job = item_job("slow", "item:slow", JobPriority::High).with_max_retries(0);
    service.submit_job(job, None).await;

    let record = wait_for_status(&service, "slow", JobStatus::Failed).await;
    assert!(record.error_message.unwrap().contains("timeout"));
    let stats = service.errors().get_statistics();
    assert_eq!(stats.by_category.get(&ErrorCategory::Timeout), Some(&1));

    service.shutdown().await;
}

#[tokio::test]
async fn test_jobs_run_in_priority_order() {
    let service = JobService::new(test_config(1), Arc::new(MockOps::new())).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    service
        .scheduler()
        .add_completion_callback(move |job: &Job, _| sink.lock().unwrap().push(job.id.clone()));

    for (id, priority) in [
        ("low-1", JobPriority::Low),
        ("medium-1", JobPriority::Medium),
        ("high-1", JobPriority::High),
        ("high-2", JobPriority::High),
    ] {
        let (accepted, _) = service
            .submit_job(item_job(id, &format!("item:{id}"), priority), None)
            .await;
        assert!(accepted);
    }

    service.start().await;
    wait_for_status(&service, "low-1", JobStatus::Completed).await;
    eventually(|| order.lock().unwrap().len() == 4).await;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["high-1", "high-2", "medium-1", "low-1"]
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_collection_job_aggregates_members() {
    let ops = Arc::new(MockOps::new().failing(
        "pl-2",
        vec![Error::InvalidInput("malformed member".into())],
    ));
    let service = JobService::new(test_config(1), ops).await;
    service.start().await;

    let job = Job::with_id(
        "collection",
        JobKind::Collection,
        payload(json!({ "url": "list:pl" })),
        JobPriority::Medium,
    );
    service.submit_job(job, None).await;

    let record = wait_for_status(&service, "collection", JobStatus::Completed).await;
    let result = record.result.unwrap();
    assert_eq!(result["total"], 3);
    assert_eq!(result["succeeded"], 2);
    assert_eq!(result["failed"], 1);

    service.shutdown().await;
}

#[tokio::test]
async fn test_retry_rejected_by_full_queue_fails_with_classified_error() {
    let ops = Arc::new(
        MockOps::new()
            .failing("first", vec![Error::Network("connection reset by peer".into())])
            .with_item_delay("slow", Duration::from_secs(2)),
    );
    let mut config = test_config(1);
    config.scheduler = SchedulerConfig::default()
        .with_rate_limit(0)
        .with_queue_capacity(1);
    let service = JobService::new(config, ops).await;
    service.errors().update_retry_policy(
        ErrorCategory::Network,
        RetryPolicy::new(3, 0.5, 0.5, 1.0).without_jitter(),
    );

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    service
        .scheduler()
        .add_completion_callback(move |job: &Job, result| {
            if job.id == "first" {
                sink.lock().unwrap().push((
                    job.status,
                    result.error.clone(),
                    result.error_category.clone(),
                ));
            }
        });
    service.start().await;

    service
        .submit_job(item_job("first", "item:first", JobPriority::High), None)
        .await;
    wait_for_status(&service, "first", JobStatus::Retry).await;

    // Keep the only worker busy and take the only queue slot before the
    // retry delay runs out.
    service
        .submit_job(item_job("slow", "item:slow", JobPriority::High), None)
        .await;
    wait_for_status(&service, "slow", JobStatus::InProgress).await;
    let (accepted, _) = service
        .submit_job(item_job("filler", "item:filler", JobPriority::Low), None)
        .await;
    assert!(accepted);

    let record = wait_for_status(&service, "first", JobStatus::Failed).await;
    let message = record.error_message.unwrap();
    assert!(message.starts_with("Network error: connection reset by peer"));
    assert!(message.contains("re-queued"));
    assert!(record.completed_at.is_some());

    eventually(|| outcomes.lock().unwrap().len() == 2).await;
    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(outcomes[0].0, JobStatus::Retry);
    let (status, error, category) = &outcomes[1];
    assert_eq!(*status, JobStatus::Failed);
    assert_eq!(error.as_deref(), Some(message.as_str()));
    assert_eq!(category.as_deref(), Some("network"));

    service.shutdown().await;
}
