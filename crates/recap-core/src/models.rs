//! Job data model shared by the queue, workers, tracker and event push.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::defaults;

/// JSON object used for job payloads and results.
pub type JsonMap = Map<String, JsonValue>;

// =============================================================================
// ENUMS
// =============================================================================

/// Kind of work a job describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Summarize a single item.
    Item,
    /// Summarize every member of a collection.
    Collection,
    /// Summarize a list of inputs, each an item or a collection.
    Batch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Item => "item",
            JobKind::Collection => "collection",
            JobKind::Batch => "batch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Lower numeric value is served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl JobPriority {
    /// Numeric rank used for queue ordering.
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Retry,
}

impl JobStatus {
    /// Completed and failed jobs never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Statuses counted as "active" by the state tracker.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::InProgress | JobStatus::Retry
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retry => "retry",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// JOB
// =============================================================================

/// A unit of work moving through the queue, a worker, and the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub payload: JsonMap,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub current_step: Option<String>,
    pub total_steps: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub result: Option<JsonValue>,
    pub worker_id: Option<String>,
    pub client_id: Option<String>,
    pub session_id: Option<String>,
}

impl Job {
    /// Create a pending job with a fresh id.
    pub fn new(kind: JobKind, payload: JsonMap, priority: JobPriority) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, payload, priority)
    }

    /// Create a pending job with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        kind: JobKind,
        payload: JsonMap,
        priority: JobPriority,
    ) -> Self {
        let total_steps = Self::derive_total_steps(kind, &payload);
        Self {
            id: id.into(),
            kind,
            priority,
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            current_step: None,
            total_steps,
            retry_count: 0,
            max_retries: defaults::JOB_MAX_RETRIES,
            error_message: None,
            result: None,
            worker_id: None,
            client_id: None,
            session_id: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    fn derive_total_steps(kind: JobKind, payload: &JsonMap) -> u32 {
        let list_len = |key: &str| {
            payload
                .get(key)
                .and_then(JsonValue::as_array)
                .map(|a| a.len() as u32)
                .unwrap_or(0)
        };
        match kind {
            JobKind::Item => 1,
            JobKind::Collection => list_len("member_ids").max(1),
            JobKind::Batch => list_len("inputs").max(1),
        }
    }

    /// Mark the job as picked up by a worker.
    pub fn start(&mut self, worker_id: impl Into<String>) {
        self.status = JobStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.worker_id = Some(worker_id.into());
        self.error_message = None;
    }

    /// Record progress. Values are clamped to [0, 1] and never move backwards
    /// while the job is in progress.
    pub fn update_progress(&mut self, progress: f64, step: impl Into<String>) {
        let progress = if progress.is_nan() {
            self.progress
        } else {
            progress.clamp(0.0, 1.0)
        };
        if self.status == JobStatus::InProgress {
            self.progress = self.progress.max(progress);
        } else {
            self.progress = progress;
        }
        self.current_step = Some(step.into());
    }

    /// Mark the job completed. Calling this again keeps the first completion time.
    pub fn complete_successfully(&mut self, result: JsonValue) {
        self.status = JobStatus::Completed;
        self.progress = 1.0;
        self.current_step = Some("completed".to_string());
        self.result = Some(result);
        self.error_message = None;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Record a failure. With `can_retry` and retries left, the job moves to
    /// RETRY and consumes one retry; otherwise it becomes FAILED.
    pub fn fail_with_error(&mut self, message: impl Into<String>, can_retry: bool) {
        self.error_message = Some(message.into());
        if can_retry && self.retry_count < self.max_retries {
            self.status = JobStatus::Retry;
            self.retry_count += 1;
            self.completed_at = None;
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(Utc::now());
        }
    }

    /// Move a RETRY job back to PENDING so it can be queued again.
    pub fn reset_for_retry(&mut self) {
        if self.status != JobStatus::Retry {
            return;
        }
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.worker_id = None;
        self.progress = 0.0;
        self.current_step = None;
    }

    /// Seconds between start and completion, if both are known.
    pub fn processing_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let finished = self.completed_at.unwrap_or_else(Utc::now);
        (finished - started).to_std().ok()
    }

    /// Payload string field, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(JsonValue::as_str)
    }
}

// =============================================================================
// RESULTS & METRICS
// =============================================================================

/// Outcome of one execution attempt, handed to completion callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub kind: JobKind,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Category name assigned by the retry engine on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
}

impl JobResult {
    pub fn success(job: &Job, data: JsonValue, elapsed: Duration) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            success: true,
            data: Some(data),
            error: None,
            error_category: None,
            processing_time_seconds: Some(elapsed.as_secs_f64()),
        }
    }

    pub fn failure(
        job: &Job,
        error: impl Into<String>,
        category: Option<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            success: false,
            data: None,
            error: Some(error.into()),
            error_category: category,
            processing_time_seconds: Some(elapsed.as_secs_f64()),
        }
    }
}

/// Running counters for a worker (or the aggregate of all workers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub total_processing_time_secs: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    pub fn record_success(&mut self, elapsed: Duration) {
        self.jobs_processed += 1;
        self.total_processing_time_secs += elapsed.as_secs_f64();
        self.last_activity = Some(Utc::now());
    }

    pub fn record_failure(&mut self, elapsed: Duration) {
        self.jobs_failed += 1;
        self.total_processing_time_secs += elapsed.as_secs_f64();
        self.last_activity = Some(Utc::now());
    }

    /// Mean time per handled job (successes and failures).
    pub fn average_processing_time_secs(&self) -> f64 {
        let handled = self.jobs_processed + self.jobs_failed;
        if handled == 0 {
            0.0
        } else {
            self.total_processing_time_secs / handled as f64
        }
    }

    /// Fold another worker's counters into this one.
    pub fn merge(&mut self, other: &WorkerMetrics) {
        self.jobs_processed += other.jobs_processed;
        self.jobs_failed += other.jobs_failed;
        self.total_processing_time_secs += other.total_processing_time_secs;
        self.last_activity = match (self.last_activity, other.last_activity) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}
