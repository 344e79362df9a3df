//! Worker tasks that pull jobs from the scheduler and run them.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use recap_core::{ContentOperations, Error, Job, JobResult, JobStatus, Result, WorkerMetrics};

use crate::config::WorkerConfig;
use crate::processor::{JobContext, JobProcessor, WorkRequest};
use crate::retry::ErrorHandler;
use crate::scheduler::JobScheduler;
use crate::tracker::JobStateTracker;

/// Event emitted by workers while jobs run.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A job was picked up by a worker.
    JobStarted { job_id: String, worker_id: String },
    /// Job progress was updated.
    JobProgress {
        job_id: String,
        progress: f64,
        step: Option<String>,
    },
    /// A failed job was scheduled to run again.
    JobRetryScheduled {
        job_id: String,
        attempt: u32,
        delay_secs: f64,
    },
    /// A worker task started.
    WorkerStarted { worker_id: String },
    /// A worker task stopped.
    WorkerStopped { worker_id: String },
}

/// Collaborators shared by every worker of a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub scheduler: Arc<JobScheduler>,
    pub tracker: Arc<JobStateTracker>,
    pub errors: Arc<ErrorHandler>,
    pub ops: Arc<dyn ContentOperations>,
    pub config: WorkerConfig,
    pub events: broadcast::Sender<WorkerEvent>,
}

impl WorkerContext {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Clears the liveness flag when the worker task ends, including by panic.
struct AliveGuard(Arc<AtomicBool>);

impl AliveGuard {
    fn arm(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handle to a spawned worker task.
pub struct WorkerHandle {
    id: String,
    join: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    metrics: Arc<Mutex<WorkerMetrics>>,
    current_job: Arc<RwLock<Option<String>>>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.join.is_finished()
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Shared metrics cell, handed to a replacement worker on restart.
    pub fn metrics_cell(&self) -> Arc<Mutex<WorkerMetrics>> {
        self.metrics.clone()
    }

    pub fn current_job(&self) -> Option<String> {
        self.current_job.read().ok().and_then(|j| j.clone())
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    /// Wait up to `timeout` for the task to finish, aborting it otherwise.
    /// Returns whether the task finished on its own.
    pub async fn join(mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(worker_id = %self.id, error = %e, "Worker task ended abnormally");
                true
            }
            Err(_) => {
                warn!(worker_id = %self.id, "Worker did not stop in time, aborting");
                self.join.abort();
                false
            }
        }
    }
}

/// A single worker: owns its processor (and summary cache) and runs jobs
/// one at a time until shutdown.
pub struct Worker {
    id: String,
    context: WorkerContext,
    processor: JobProcessor,
    metrics: Arc<Mutex<WorkerMetrics>>,
    current_job: Arc<RwLock<Option<String>>>,
}

impl Worker {
    /// Spawn a worker task. `metrics` carries over counters from a worker
    /// this one replaces.
    pub fn spawn(
        id: impl Into<String>,
        context: WorkerContext,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<Mutex<WorkerMetrics>>,
    ) -> WorkerHandle {
        let id = id.into();
        let alive = Arc::new(AtomicBool::new(true));
        let current_job = Arc::new(RwLock::new(None));

        let worker = Worker {
            id: id.clone(),
            processor: JobProcessor::new(context.ops.clone()),
            context,
            metrics: metrics.clone(),
            current_job: current_job.clone(),
        };

        let guard = AliveGuard::arm(alive.clone());
        let join = tokio::spawn(async move {
            let _guard = guard;
            worker.run(shutdown).await;
        });

        WorkerHandle {
            id,
            join,
            alive,
            metrics,
            current_job,
        }
    }

    #[instrument(skip(self, shutdown), fields(worker_id = %self.id))]
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cached = self.processor.load_cache().await;
        info!(cached_entries = cached, "Worker started");
        self.context.emit(WorkerEvent::WorkerStarted {
            worker_id: self.id.clone(),
        });

        let timeout = self.context.config.dequeue_timeout;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                job = self.context.scheduler.get_next(timeout) => job,
            };

            if let Some(job) = job {
                self.execute(job, &shutdown).await;
            }
        }

        self.context.emit(WorkerEvent::WorkerStopped {
            worker_id: self.id.clone(),
        });
        info!("Worker stopped");
    }

    fn set_current_job(&self, job_id: Option<&str>) {
        if let Ok(mut current) = self.current_job.write() {
            *current = job_id.map(String::from);
        }
    }

    fn record_metrics(&self, elapsed: Duration, success: bool) {
        if let Ok(mut metrics) = self.metrics.lock() {
            if success {
                metrics.record_success(elapsed);
            } else {
                metrics.record_failure(elapsed);
            }
        }
    }

    /// Run one execution attempt. Errors end up as a job status transition,
    /// never as an error out of the worker loop.
    async fn execute(&self, mut job: Job, shutdown: &watch::Receiver<bool>) {
        let started = Instant::now();
        let job_id = job.id.clone();

        job.start(&self.id);
        self.set_current_job(Some(&job_id));
        self.context.tracker.track(&job).await;
        self.context.emit(WorkerEvent::JobStarted {
            job_id: job_id.clone(),
            worker_id: self.id.clone(),
        });
        info!(job_id = %job_id, kind = %job.kind, attempt = job.retry_count, "Processing job");

        let request = WorkRequest::from_job(&job);
        let events = self.context.events.clone();
        let mut ctx = JobContext::new(job)
            .with_tracker(self.context.tracker.clone())
            .with_progress_callback(move |job: &Job| {
                let _ = events.send(WorkerEvent::JobProgress {
                    job_id: job.id.clone(),
                    progress: job.progress,
                    step: job.current_step.clone(),
                });
            });

        let outcome = match request {
            Ok(request) => self.run_with_timeout(&mut ctx, &request).await,
            Err(e) => Err(e),
        };

        let job = ctx.into_job();
        let elapsed = started.elapsed();
        match outcome {
            Ok(data) => self.finish_success(job, data, elapsed).await,
            Err(error) => self.finish_failure(job, error, elapsed, shutdown).await,
        }
        self.set_current_job(None);
    }

    async fn run_with_timeout(&self, ctx: &mut JobContext, request: &WorkRequest) -> Result<JsonValue> {
        let job_timeout = self.context.config.job_timeout;
        let attempt = AssertUnwindSafe(self.processor.process(ctx, request)).catch_unwind();

        match tokio::time::timeout(job_timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal("job processing panicked".into())),
            Err(_) => Err(Error::Timeout(format!(
                "Job exceeded timeout of {job_timeout:?}"
            ))),
        }
    }

    async fn finish_success(&self, mut job: Job, data: JsonValue, elapsed: Duration) {
        job.complete_successfully(data.clone());
        self.record_metrics(elapsed, true);
        self.context.tracker.track(&job).await;

        info!(
            job_id = %job.id,
            kind = %job.kind,
            duration_ms = elapsed.as_millis() as u64,
            "Job completed successfully"
        );

        let result = JobResult::success(&job, data, elapsed);
        self.context.scheduler.notify_completion(&job, &result);
    }

    async fn finish_failure(
        &self,
        mut job: Job,
        error: Error,
        elapsed: Duration,
        shutdown: &watch::Receiver<bool>,
    ) {
        let info = self
            .context
            .errors
            .handle(&error, &job.id, job.retry_count, Some(job.kind.as_str()));
        let can_retry = info.retry_eligible && job.retry_count < job.max_retries;

        job.fail_with_error(error.to_string(), can_retry);
        self.record_metrics(elapsed, false);
        self.context.tracker.track(&job).await;

        warn!(
            job_id = %job.id,
            kind = %job.kind,
            category = %info.category,
            error = %error,
            attempt = job.retry_count,
            status = %job.status,
            duration_ms = elapsed.as_millis() as u64,
            "Job failed"
        );

        let result = JobResult::failure(
            &job,
            error.to_string(),
            Some(info.category.as_str().to_string()),
            elapsed,
        );
        self.context.scheduler.notify_completion(&job, &result);

        if job.status == JobStatus::Retry {
            self.schedule_retry(job, result, info.retry_delay_duration(), shutdown.clone());
        }
    }

    /// Re-queue `job` after `delay`, unless the pool shuts down first.
    ///
    /// `failure` is the result of the attempt that triggered the retry. When
    /// the job cannot be re-queued it becomes the terminal outcome.
    fn schedule_retry(
        &self,
        job: Job,
        failure: JobResult,
        delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let scheduler = self.context.scheduler.clone();
        let tracker = self.context.tracker.clone();
        self.context.emit(WorkerEvent::JobRetryScheduled {
            job_id: job.id.clone(),
            attempt: job.retry_count,
            delay_secs: delay.as_secs_f64(),
        });
        debug!(job_id = %job.id, attempt = job.retry_count, delay_ms = delay.as_millis() as u64, "Retry scheduled");

        tokio::spawn(async move {
            let mut job = job;
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!(job_id = %job.id, "Shutdown before retry, leaving job in retry state");
                    return;
                }
            }

            job.reset_for_retry();
            tracker.track(&job).await;
            if !scheduler.requeue(job.clone()).await {
                let error = failure.error.clone().unwrap_or_default();
                job.fail_with_error(format!("{error} (retry could not be re-queued)"), false);
                tracker.track(&job).await;
                warn!(
                    job_id = %job.id,
                    attempt = job.retry_count,
                    error = %error,
                    "Queue rejected retry, job failed"
                );

                let result = JobResult {
                    error: job.error_message.clone(),
                    ..failure
                };
                scheduler.notify_completion(&job, &result);
            }
        });
    }
}
