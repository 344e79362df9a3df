//! Job state transitions and the event wire format, exercised through the
//! public API only.

use recap_core::{EventKind, Job, JobKind, JobPriority, JobStatus, JsonMap, StreamEvent};
use serde_json::json;

fn item() -> Job {
    let mut payload = JsonMap::new();
    payload.insert("url".into(), json!("https://example.com/watch?v=abc"));
    Job::new(JobKind::Item, payload, JobPriority::High).with_max_retries(2)
}

#[test]
fn test_retry_cycle_until_exhausted() {
    let mut job = item();

    for attempt in 1..=2 {
        job.start("worker-1");
        job.update_progress(0.5, "content fetched");
        job.fail_with_error("connection reset", true);
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.retry_count, attempt);
        assert!(job.completed_at.is_none());

        job.reset_for_retry();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.worker_id.is_none());
    }

    job.start("worker-2");
    job.fail_with_error("connection reset", true);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert!(job.completed_at.is_some());
    assert!(job.status.is_terminal());
}

#[test]
fn test_job_serializes_with_iso_timestamps() {
    let mut job = item().with_client("203.0.113.9");
    job.start("worker-1");
    job.complete_successfully(json!({"summary": "short"}));

    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["kind"], "item");
    assert_eq!(value["priority"], "high");
    assert_eq!(value["status"], "completed");
    assert!(value["created_at"].as_str().unwrap().contains('T'));

    let back: Job = serde_json::from_value(value).unwrap();
    assert_eq!(back, job);
}

#[test]
fn test_sse_frame_layout() {
    let mut data = JsonMap::new();
    data.insert("job_id".into(), json!("j-1"));
    data.insert("progress".into(), json!(0.3));
    let event = StreamEvent::new(EventKind::JobProgress, data, "client-7");

    let frame = event.to_sse();
    let body = frame
        .strip_prefix("event: job_progress\ndata: ")
        .and_then(|rest| rest.strip_suffix("\n\n"))
        .expect("frame layout");
    let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["job_id"], "j-1");
    assert_eq!(parsed["client_id"], "client-7");
    assert!(parsed["timestamp"].is_string());
}
