//! Submission surface tying the scheduler, workers, tracker, retry engine
//! and event push together.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use recap_core::{ContentOperations, EventKind, Job, JobKind, JobPriority, JobStatus, JsonMap};

use crate::config::JobSystemConfig;
use crate::connections::{ConnectionManager, ConnectionStats};
use crate::manager::{WorkerBuilder, WorkerManager, WorkerPoolStats};
use crate::queue::QueueStats;
use crate::retry::{ErrorHandler, ErrorStatistics};
use crate::scheduler::JobScheduler;
use crate::tracker::{JobRecord, JobStateTracker};
use crate::worker::WorkerEvent;

/// Error recorded on jobs that were still active when the previous process
/// stopped.
pub const INTERRUPTED_MESSAGE: &str = "Job interrupted by shutdown";

/// Point-in-time view of the whole job system.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue: QueueStats,
    pub active_jobs: usize,
    pub workers: WorkerPoolStats,
    pub connections: ConnectionStats,
    pub errors: ErrorStatistics,
}

/// The job system as seen by a caller.
pub struct JobService {
    config: JobSystemConfig,
    scheduler: Arc<JobScheduler>,
    tracker: Arc<JobStateTracker>,
    errors: Arc<ErrorHandler>,
    workers: Arc<WorkerManager>,
    connections: Arc<ConnectionManager>,
    shutdown_tx: watch::Sender<bool>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl JobService {
    /// Build the service, restoring tracked state from the configured
    /// snapshot file. Restored jobs that were still active are marked failed.
    pub async fn new(config: JobSystemConfig, ops: Arc<dyn ContentOperations>) -> Self {
        let scheduler = Arc::new(JobScheduler::new(config.scheduler.clone()));
        let tracker = Arc::new(JobStateTracker::open(config.tracker.clone()).await);
        tracker.fail_interrupted(INTERRUPTED_MESSAGE).await;
        let errors = Arc::new(ErrorHandler::new());
        let connections = Arc::new(ConnectionManager::new(config.connections.clone()));
        let workers = Arc::new(
            WorkerBuilder::new(scheduler.clone(), tracker.clone(), ops)
                .with_config(config.workers.clone())
                .with_error_handler(errors.clone())
                .build(),
        );

        let push = connections.clone();
        scheduler.add_completion_callback(move |job, result| {
            push.notify_job_finished(job, result);
        });

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            scheduler,
            tracker,
            errors,
            workers,
            connections,
            shutdown_tx,
            forwarder: Mutex::new(None),
        }
    }

    /// Start workers, the heartbeat, and event forwarding.
    pub async fn start(&self) {
        self.spawn_forwarder();
        self.connections.start();
        self.workers.start().await;
        info!(
            workers = self.workers.worker_count(),
            queue_capacity = self.config.scheduler.queue_capacity,
            "Job service started"
        );
    }

    fn spawn_forwarder(&self) {
        let Ok(mut slot) = self.forwarder.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let mut events = self.workers.events();
        let mut shutdown = self.shutdown_tx.subscribe();
        let connections = self.connections.clone();
        *slot = Some(tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(WorkerEvent::JobStarted { job_id, worker_id }) => {
                        connections.notify_job_started(&job_id, &worker_id);
                    }
                    Ok(WorkerEvent::JobProgress {
                        job_id,
                        progress,
                        step,
                    }) => {
                        connections.notify_job_progress(&job_id, progress, step.as_deref());
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stop workers, then event forwarding and the connection manager.
    pub async fn shutdown(&self) {
        self.workers.shutdown().await;
        self.shutdown_tx.send_replace(true);
        let forwarder = self.forwarder.lock().ok().and_then(|mut f| f.take());
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                warn!(error = %e, "Event forwarder ended abnormally");
            }
        }
        self.connections.shutdown().await;
        if let Err(e) = self.tracker.persist().await {
            warn!(error = %e, "Failed to persist job state on shutdown");
        }
        info!("Job service stopped");
    }

    /// Build a job carrying the configured retry budget.
    pub fn new_job(&self, kind: JobKind, payload: JsonMap, priority: JobPriority) -> Job {
        Job::new(kind, payload, priority).with_max_retries(self.config.max_retries)
    }

    /// Submit a job. The job is tracked as pending before it is queued and
    /// the record is dropped again if the scheduler rejects it.
    pub async fn submit_job(&self, mut job: Job, client_ip: Option<&str>) -> (bool, String) {
        if self
            .tracker
            .get_status(&job.id)
            .await
            .is_some_and(|r| r.status.is_active())
        {
            return (false, format!("Job {} is already queued", job.id));
        }

        if job.client_id.is_none() {
            job.client_id = client_ip.map(String::from);
        }

        self.tracker.track(&job).await;
        let (accepted, message) = self.scheduler.submit(job.clone(), client_ip).await;
        if accepted {
            self.connections.notify_job_queued(&job);
        } else {
            self.tracker.delete(&job.id).await;
        }
        (accepted, message)
    }

    /// Cancel a job still waiting in the queue.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        if !self.scheduler.cancel(job_id).await {
            return false;
        }

        if let Err(e) = self
            .tracker
            .update_progress(
                job_id,
                0.0,
                Some(JobStatus::Failed),
                Some("Job cancelled"),
                Some("Job cancelled"),
            )
            .await
        {
            warn!(job_id, error = %e, "Cancelled job was not tracked");
        }

        let mut data = JsonMap::new();
        data.insert("job_id".into(), job_id.into());
        data.insert("status".into(), JobStatus::Failed.as_str().into());
        data.insert("error".into(), "Job cancelled".into());
        self.connections.broadcast(EventKind::JobFailed, data, None);
        true
    }

    pub async fn get_job_status(&self, job_id: &str) -> Option<JobRecord> {
        self.tracker.get_status(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Vec<JobRecord> {
        self.tracker.get_all(status).await
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue: self.scheduler.queue_stats().await,
            active_jobs: self.tracker.get_active_count().await,
            workers: self.workers.stats().await,
            connections: self.connections.get_connection_stats(),
            errors: self.errors.get_statistics(),
        }
    }

    pub fn config(&self) -> &JobSystemConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<JobStateTracker> {
        &self.tracker
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}
