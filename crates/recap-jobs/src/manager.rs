//! Worker pool lifecycle: start, supervise, restart, and stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use recap_core::{defaults, ContentOperations, WorkerMetrics};

use crate::config::{WorkerConfig, MIN_TICK};
use crate::retry::ErrorHandler;
use crate::scheduler::JobScheduler;
use crate::tracker::JobStateTracker;
use crate::worker::{Worker, WorkerContext, WorkerEvent, WorkerHandle};

/// Status of one worker slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub alive: bool,
    pub current_job: Option<String>,
    pub metrics: WorkerMetrics,
}

/// Aggregate view of the pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub alive_workers: usize,
    pub total_jobs_processed: u64,
    pub total_jobs_failed: u64,
    pub average_processing_time_secs: f64,
    pub restarts: u64,
    pub workers: Vec<WorkerStatus>,
}

/// Owns the worker tasks and the supervising loop.
pub struct WorkerManager {
    context: WorkerContext,
    shutdown_tx: watch::Sender<bool>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    restarts: AtomicU64,
}

impl WorkerManager {
    pub fn new(context: WorkerContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            context,
            shutdown_tx,
            workers: tokio::sync::Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    /// Configured pool size.
    pub fn worker_count(&self) -> usize {
        self.context.config.worker_count
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !*self.shutdown_tx.borrow()
    }

    /// Subscribe to worker lifecycle and progress events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.context.events.subscribe()
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Spawn the workers and the supervising loop. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Worker manager already started");
            return;
        }

        {
            let mut workers = self.workers.lock().await;
            for index in 0..self.worker_count() {
                workers.push(self.spawn_worker(
                    worker_name(index),
                    Arc::new(Mutex::new(WorkerMetrics::default())),
                ));
            }
        }

        let manager = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.context.config.health_check_interval.max(MIN_TICK);
        let supervisor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        manager.health_check().await;
                        manager.context.scheduler.cleanup_periodic().await;
                    }
                }
            }
            debug!("Worker supervisor stopped");
        });
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(supervisor);
        }

        info!(
            workers = self.worker_count(),
            health_check_secs = interval.as_secs(),
            "Worker manager started"
        );
    }

    fn spawn_worker(&self, id: String, metrics: Arc<Mutex<WorkerMetrics>>) -> WorkerHandle {
        Worker::spawn(
            id,
            self.context.clone(),
            self.shutdown_tx.subscribe(),
            metrics,
        )
    }

    /// Restart workers whose task has ended. Returns how many were restarted.
    pub async fn health_check(&self) -> usize {
        if *self.shutdown_tx.borrow() {
            return 0;
        }

        let mut workers = self.workers.lock().await;
        let mut restarted = 0;
        for slot in workers.iter_mut() {
            if slot.is_alive() {
                continue;
            }
            warn!(worker_id = %slot.id(), "Worker is not alive, restarting");
            let replacement = self.spawn_worker(slot.id().to_string(), slot.metrics_cell());
            *slot = replacement;
            restarted += 1;
        }

        if restarted > 0 {
            self.restarts.fetch_add(restarted as u64, Ordering::SeqCst);
        }
        restarted
    }

    /// Signal every worker to stop and wait for them, bounded by the
    /// configured shutdown timeout per worker.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let handles: Vec<WorkerHandle> = std::mem::take(&mut *self.workers.lock().await);
        let timeout = self.context.config.shutdown_timeout;
        let joined = futures::future::join_all(handles.into_iter().map(|h| h.join(timeout))).await;
        let aborted = joined.iter().filter(|clean| !**clean).count();

        let supervisor = self.supervisor.lock().ok().and_then(|mut s| s.take());
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Worker supervisor ended abnormally");
            }
        }

        info!(workers = joined.len(), aborted, "Worker manager stopped");
    }

    pub async fn stats(&self) -> WorkerPoolStats {
        let workers = self.workers.lock().await;
        let mut totals = WorkerMetrics::default();
        let statuses: Vec<WorkerStatus> = workers
            .iter()
            .map(|w| {
                let metrics = w.metrics();
                totals.merge(&metrics);
                WorkerStatus {
                    worker_id: w.id().to_string(),
                    alive: w.is_alive(),
                    current_job: w.current_job(),
                    metrics,
                }
            })
            .collect();

        WorkerPoolStats {
            worker_count: statuses.len(),
            alive_workers: statuses.iter().filter(|s| s.alive).count(),
            total_jobs_processed: totals.jobs_processed,
            total_jobs_failed: totals.jobs_failed,
            average_processing_time_secs: totals.average_processing_time_secs(),
            restarts: self.restarts.load(Ordering::SeqCst),
            workers: statuses,
        }
    }

    #[cfg(test)]
    async fn kill_worker(&self, index: usize) {
        let workers = self.workers.lock().await;
        if let Some(worker) = workers.get(index) {
            worker.abort();
        }
    }
}

fn worker_name(index: usize) -> String {
    format!("worker-{}", index + 1)
}

/// Builder for a worker pool.
pub struct WorkerBuilder {
    scheduler: Arc<JobScheduler>,
    tracker: Arc<JobStateTracker>,
    ops: Arc<dyn ContentOperations>,
    errors: Option<Arc<ErrorHandler>>,
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new(
        scheduler: Arc<JobScheduler>,
        tracker: Arc<JobStateTracker>,
        ops: Arc<dyn ContentOperations>,
    ) -> Self {
        Self {
            scheduler,
            tracker,
            ops,
            errors: None,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn build(self) -> WorkerManager {
        let (events, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        WorkerManager::new(WorkerContext {
            scheduler: self.scheduler,
            tracker: self.tracker,
            errors: self.errors.unwrap_or_default(),
            ops: self.ops,
            config: self.config,
            events,
        })
    }
}
