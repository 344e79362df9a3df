//! Configuration for the queue, workers, state tracker and event push.
//!
//! Each component has its own config struct with chained `with_*` setters;
//! [`JobSystemConfig`] bundles them and knows how to read the environment.

use std::path::PathBuf;
use std::time::Duration;

use recap_core::defaults;

/// Shortest period accepted for periodic tasks. `tokio::time::interval`
/// panics on a zero period.
pub(crate) const MIN_TICK: Duration = Duration::from_millis(1);

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Queue capacity and per-client rate limiting.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    /// Submissions per client per window. Zero disables rate limiting.
    pub rate_limit_per_minute: usize,
    pub rate_limit_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
            rate_limit_per_minute: defaults::RATE_LIMIT_PER_MINUTE,
            rate_limit_window: Duration::from_secs(defaults::RATE_LIMIT_WINDOW_SECS),
        }
    }
}

impl SchedulerConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: usize) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }
}

/// Worker pool sizing and timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// How long a worker blocks on an empty queue between shutdown checks.
    pub dequeue_timeout: Duration,
    pub health_check_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Upper bound on a single execution attempt.
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            dequeue_timeout: Duration::from_millis(defaults::DEQUEUE_TIMEOUT_MS),
            health_check_interval: Duration::from_secs(defaults::HEALTH_CHECK_INTERVAL_SECS),
            shutdown_timeout: Duration::from_secs(defaults::WORKER_SHUTDOWN_TIMEOUT_SECS),
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval.max(MIN_TICK);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Durable job state settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Snapshot file. `None` keeps state in memory only.
    pub state_file: Option<PathBuf>,
    pub retention: chrono::Duration,
    pub cleanup_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            retention: chrono::Duration::hours(defaults::JOB_RETENTION_HOURS),
            cleanup_interval: Duration::from_secs(defaults::STATE_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl TrackerConfig {
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn with_retention(mut self, retention: chrono::Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Streaming connection limits and heartbeat timing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_connections: usize,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub stale_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::MAX_CONNECTIONS,
            queue_capacity: defaults::CONNECTION_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECS),
            stale_timeout: Duration::from_secs(defaults::STALE_CONNECTION_SECS),
        }
    }
}

impl ConnectionConfig {
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_TICK);
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }
}

/// Full configuration surface of the job system.
#[derive(Debug, Clone)]
pub struct JobSystemConfig {
    pub scheduler: SchedulerConfig,
    pub workers: WorkerConfig,
    pub tracker: TrackerConfig,
    pub connections: ConnectionConfig,
    /// Retry budget for jobs built by `JobService::new_job`.
    pub max_retries: u32,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            workers: WorkerConfig::default(),
            tracker: TrackerConfig::default(),
            connections: ConnectionConfig::default(),
            max_retries: defaults::JOB_MAX_RETRIES,
        }
    }
}

impl JobSystemConfig {
    /// Apply a `.env` file if one exists, then read the environment.
    pub fn load() -> Self {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_env()
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `RECAP_WORKERS` | `3` | Number of workers |
    /// | `RECAP_QUEUE_CAPACITY` | `1000` | Queue capacity |
    /// | `RECAP_RATE_LIMIT_PER_MINUTE` | `10` | Per-client submissions per minute |
    /// | `RECAP_HEARTBEAT_INTERVAL_SECS` | `30` | Connection heartbeat interval |
    /// | `RECAP_MAX_CONNECTIONS` | `100` | Maximum streaming connections |
    /// | `RECAP_JOB_RETENTION_HOURS` | `24` | Retention window for finished jobs |
    /// | `RECAP_MAX_RETRIES` | `3` | Default max retries per job |
    /// | `RECAP_STATE_FILE` | unset | Durable job state snapshot path |
    /// | `RECAP_JOB_TIMEOUT_SECS` | `600` | Per-attempt execution timeout |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>("RECAP_WORKERS") {
            config.workers = config.workers.with_worker_count(workers);
        }
        if let Some(secs) = env_parse::<u64>("RECAP_JOB_TIMEOUT_SECS") {
            config.workers = config.workers.with_job_timeout(Duration::from_secs(secs));
        }
        if let Some(capacity) = env_parse::<usize>("RECAP_QUEUE_CAPACITY") {
            config.scheduler = config.scheduler.with_queue_capacity(capacity);
        }
        if let Some(limit) = env_parse::<usize>("RECAP_RATE_LIMIT_PER_MINUTE") {
            config.scheduler = config.scheduler.with_rate_limit(limit);
        }
        if let Some(secs) = env_parse::<u64>("RECAP_HEARTBEAT_INTERVAL_SECS") {
            config.connections = config
                .connections
                .with_heartbeat_interval(Duration::from_secs(secs));
        }
        if let Some(max) = env_parse::<usize>("RECAP_MAX_CONNECTIONS") {
            config.connections = config.connections.with_max_connections(max);
        }
        if let Some(hours) = env_parse::<i64>("RECAP_JOB_RETENTION_HOURS") {
            config.tracker = config.tracker.with_retention(chrono::Duration::hours(hours));
        }
        if let Some(path) = std::env::var("RECAP_STATE_FILE")
            .ok()
            .filter(|v| !v.is_empty())
        {
            config.tracker = config.tracker.with_state_file(path);
        }
        if let Some(max_retries) = env_parse::<u32>("RECAP_MAX_RETRIES") {
            config.max_retries = max_retries;
        }

        config
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_connections(mut self, connections: ConnectionConfig) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
