//! Job scheduler: the queue plus per-client rate limiting, cancellation and
//! completion callbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use recap_core::{defaults, Job, JobResult, JobStatus};

use crate::config::SchedulerConfig;
use crate::queue::{PriorityJobQueue, QueueStats};

/// Callback invoked by workers after every execution attempt.
pub type CompletionCallback = Arc<dyn Fn(&Job, &JobResult) + Send + Sync>;

/// Outcome of a housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Clients whose rate-limit window emptied out and was dropped.
    pub rate_limit_entries_purged: usize,
    /// Orphaned heap keys dropped by compaction.
    pub heap_entries_compacted: usize,
}

/// Priority scheduler shared by the submission surface and the workers.
pub struct JobScheduler {
    queue: PriorityJobQueue,
    config: SchedulerConfig,
    rate_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    callbacks: RwLock<Vec<CompletionCallback>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            queue: PriorityJobQueue::new(config.queue_capacity),
            config,
            rate_windows: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Submit a job on behalf of `client_id`.
    ///
    /// Returns whether the job was accepted and a human-readable message.
    pub async fn submit(&self, job: Job, client_id: Option<&str>) -> (bool, String) {
        let job_id = job.id.clone();

        if let Some(client) = client_id {
            if !self.try_acquire_slot(client).await {
                warn!(client_id = client, job_id = %job_id, "Rate limit exceeded");
                return (
                    false,
                    format!(
                        "Rate limit exceeded: max {} jobs per minute",
                        self.config.rate_limit_per_minute
                    ),
                );
            }
        }

        if self.queue.put(job).await {
            let queue_size = self.queue.size().await;
            info!(job_id = %job_id, queue_size, "Job queued");
            (true, format!("Job {job_id} queued"))
        } else {
            if let Some(client) = client_id {
                self.release_slot(client).await;
            }
            let message = if self.queue.peek(&job_id).await.is_some() {
                format!("Job {job_id} is already queued")
            } else {
                format!(
                    "Queue is full ({} jobs), try again later",
                    self.queue.capacity()
                )
            };
            warn!(job_id = %job_id, %message, "Job rejected");
            (false, message)
        }
    }

    /// Put a job back on the queue after a retry delay. Not rate limited.
    pub async fn requeue(&self, job: Job) -> bool {
        let job_id = job.id.clone();
        let accepted = self.queue.put(job).await;
        if accepted {
            debug!(job_id = %job_id, "Job re-queued for retry");
        } else {
            warn!(job_id = %job_id, "Failed to re-queue job for retry");
        }
        accepted
    }

    /// Cancel a queued job. Only jobs still pending can be cancelled.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.queue.peek(job_id).await {
            Some(job) if job.status == JobStatus::Pending => {
                let removed = self.queue.remove(job_id).await;
                if removed {
                    info!(job_id, "Job cancelled");
                }
                removed
            }
            Some(job) => {
                debug!(job_id, status = %job.status, "Job not cancellable");
                false
            }
            None => false,
        }
    }

    /// Next job for a worker, waiting up to `timeout`.
    pub async fn get_next(&self, timeout: Duration) -> Option<Job> {
        self.queue.get(timeout).await
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.queue.peek(job_id).await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn queue(&self) -> &PriorityJobQueue {
        &self.queue
    }

    pub fn add_completion_callback<F>(&self, callback: F)
    where
        F: Fn(&Job, &JobResult) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Run every registered completion callback. Called by workers.
    pub fn notify_completion(&self, job: &Job, result: &JobResult) {
        let callbacks: Vec<CompletionCallback> = match self.callbacks.read() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(job, result);
        }
    }

    /// Purge expired rate-limit windows and compact the queue when orphaned
    /// heap keys make up a large share of it.
    pub async fn cleanup_periodic(&self) -> CleanupReport {
        let now = Instant::now();
        let window = self.config.rate_limit_window;

        let purged = {
            let mut windows = self.rate_windows.lock().await;
            let before = windows.len();
            windows.retain(|_, stamps| {
                while stamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= window)
                {
                    stamps.pop_front();
                }
                !stamps.is_empty()
            });
            before - windows.len()
        };

        let compacted = if self.queue.stale_ratio().await > defaults::QUEUE_COMPACTION_RATIO {
            self.queue.compact().await
        } else {
            0
        };

        if purged > 0 || compacted > 0 {
            debug!(purged, compacted, "Scheduler cleanup");
        }

        CleanupReport {
            rate_limit_entries_purged: purged,
            heap_entries_compacted: compacted,
        }
    }

    /// Record a submission for `client` if its window has room.
    async fn try_acquire_slot(&self, client: &str) -> bool {
        let limit = self.config.rate_limit_per_minute;
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let window = self.config.rate_limit_window;
        let mut windows = self.rate_windows.lock().await;
        let stamps = windows.entry(client.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= limit {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Give back a slot taken for a submission the queue then rejected.
    async fn release_slot(&self, client: &str) {
        if self.config.rate_limit_per_minute == 0 {
            return;
        }
        let mut windows = self.rate_windows.lock().await;
        if let Some(stamps) = windows.get_mut(client) {
            stamps.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_core::{JobKind, JobPriority, JsonMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(id: &str) -> Job {
        Job::with_id(id, JobKind::Item, JsonMap::new(), JobPriority::Medium)
    }

    fn scheduler(capacity: usize, rate: usize) -> JobScheduler {
        JobScheduler::new(
            SchedulerConfig::default()
                .with_queue_capacity(capacity)
                .with_rate_limit(rate),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_sliding_window() {
        let scheduler = scheduler(10, 2);

        assert!(scheduler.submit(job("1"), Some("client-x")).await.0);
        assert!(scheduler.submit(job("2"), Some("client-x")).await.0);
        let (accepted, message) = scheduler.submit(job("3"), Some("client-x")).await;
        assert!(!accepted);
        assert!(message.contains("Rate limit"));

        // Other clients are unaffected.
        assert!(scheduler.submit(job("other"), Some("client-y")).await.0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(scheduler.submit(job("4"), Some("client-x")).await.0);
    }

    #[tokio::test]
    async fn test_no_client_id_skips_rate_limit() {
        let scheduler = scheduler(10, 1);
        assert!(scheduler.submit(job("1"), None).await.0);
        assert!(scheduler.submit(job("2"), None).await.0);
    }

    #[tokio::test]
    async fn test_queue_full_releases_rate_slot() {
        let scheduler = scheduler(1, 2);
        assert!(scheduler.submit(job("1"), Some("c")).await.0);
        let (accepted, message) = scheduler.submit(job("2"), Some("c")).await;
        assert!(!accepted);
        assert!(message.contains("Queue is full"));

        // The rejected submission did not consume the second slot.
        scheduler.get_next(Duration::ZERO).await;
        assert!(scheduler.submit(job("3"), Some("c")).await.0);
    }

    #[tokio::test]
    async fn test_duplicate_submission_message() {
        let scheduler = scheduler(10, 0);
        assert!(scheduler.submit(job("dup"), None).await.0);
        let (accepted, message) = scheduler.submit(job("dup"), None).await;
        assert!(!accepted);
        assert!(message.contains("already queued"));
    }

    #[tokio::test]
    async fn test_cancel_pending_only() {
        let scheduler = scheduler(10, 0);
        scheduler.submit(job("a"), None).await;
        assert!(scheduler.cancel("a").await);
        assert!(!scheduler.cancel("a").await);
        assert!(scheduler.get_job("a").await.is_none());

        let mut running = job("b");
        running.start("worker-1");
        scheduler.requeue(running).await;
        assert!(!scheduler.cancel("b").await);
    }

    #[tokio::test]
    async fn test_completion_callbacks_invoked() {
        let scheduler = scheduler(10, 0);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            scheduler.add_completion_callback(move |_job, result| {
                assert!(result.success);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let job = job("done");
        let result = JobResult::success(&job, serde_json::json!({}), Duration::from_millis(5));
        scheduler.notify_completion(&job, &result);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_purges_windows_and_compacts() {
        let scheduler = scheduler(10, 5);
        scheduler.submit(job("a"), Some("c1")).await;
        scheduler.submit(job("b"), Some("c2")).await;
        scheduler.cancel("a").await;
        scheduler.cancel("b").await;

        let report = scheduler.cleanup_periodic().await;
        assert_eq!(report.rate_limit_entries_purged, 0);
        assert_eq!(report.heap_entries_compacted, 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = scheduler.cleanup_periodic().await;
        assert_eq!(report.rate_limit_entries_purged, 2);
        assert_eq!(report.heap_entries_compacted, 0);
    }
}
