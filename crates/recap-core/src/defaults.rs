//! Centralized default constants for the recap job system.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs in `recap-jobs` fall back to these when neither the
//! caller nor the environment provides a value.

// =============================================================================
// QUEUE & SCHEDULER
// =============================================================================

/// Maximum number of jobs held by the priority queue.
pub const QUEUE_CAPACITY: usize = 1000;

/// Per-client submissions allowed inside one rate-limit window.
pub const RATE_LIMIT_PER_MINUTE: usize = 10;

/// Length of the sliding rate-limit window in seconds.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Stale heap entries must exceed this share of the heap before compaction.
pub const QUEUE_COMPACTION_RATIO: f64 = 0.5;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum retry count for failed jobs.
pub const JOB_MAX_RETRIES: u32 = 3;

/// Default number of concurrent workers.
pub const WORKER_COUNT: usize = 3;

/// How long a worker waits on an empty queue before re-checking for shutdown.
pub const DEQUEUE_TIMEOUT_MS: u64 = 1000;

/// Interval of the manager's health-check and housekeeping loop.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Upper bound on waiting for a single worker to stop during shutdown.
pub const WORKER_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Default job execution timeout in seconds (10 minutes).
pub const JOB_TIMEOUT_SECS: u64 = 600;

/// Capacity of the worker lifecycle event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Model selector used when a job payload does not name one.
pub const DEFAULT_MODEL: &str = "default";

// =============================================================================
// STATE TRACKING
// =============================================================================

/// Terminal job records older than this are removed by cleanup.
pub const JOB_RETENTION_HOURS: i64 = 24;

/// Minimum spacing between opportunistic cleanup passes.
pub const STATE_CLEANUP_INTERVAL_SECS: u64 = 3600;

// =============================================================================
// EVENT PUSH
// =============================================================================

/// Capacity of each connection's outbound event queue.
pub const CONNECTION_QUEUE_CAPACITY: usize = 1000;

/// Maximum number of simultaneous streaming connections.
pub const MAX_CONNECTIONS: usize = 100;

/// Heartbeat interval in seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connections idle for longer than this are dropped.
pub const STALE_CONNECTION_SECS: u64 = 300;

/// Fraction of the heartbeat interval after which an idle connection gets a ping.
pub const HEARTBEAT_IDLE_FRACTION: f64 = 0.8;

/// Maximum number of events returned by a single `get_events` call.
pub const EVENT_BATCH_MAX: usize = 100;
