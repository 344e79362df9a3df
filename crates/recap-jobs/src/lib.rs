//! # recap-jobs
//!
//! In-process job system for recap.
//!
//! This crate provides:
//! - A bounded priority queue with per-client rate limiting
//! - A supervised pool of async workers with per-job timeouts
//! - Durable job state tracking with atomic snapshots
//! - Error classification and exponential-backoff retries
//! - Live job events pushed to streaming clients
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use recap_jobs::{Job, JobKind, JobPriority, JobService, JobSystemConfig};
//!
//! let service = JobService::new(JobSystemConfig::load(), Arc::new(MyOps::new())).await;
//! service.start().await;
//!
//! // Subscribe a streaming client
//! let client = service.connections().add_connection(None, None)?;
//!
//! let job = Job::new(JobKind::Item, payload, JobPriority::High);
//! let (accepted, message) = service.submit_job(job, Some("203.0.113.7")).await;
//!
//! for event in client.get_events(std::time::Duration::from_secs(30)).await {
//!     print!("{}", event.to_sse());
//! }
//!
//! // Graceful shutdown
//! service.shutdown().await;
//! ```

pub mod config;
pub mod connections;
pub mod manager;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod tracker;
pub mod worker;

// Re-export core types
pub use recap_core::*;

pub use config::{
    ConnectionConfig, JobSystemConfig, SchedulerConfig, TrackerConfig, WorkerConfig,
};
pub use connections::{
    BroadcastOutcome, Connection, ConnectionInfo, ConnectionManager, ConnectionStats,
    HeartbeatReport,
};
pub use manager::{WorkerBuilder, WorkerManager, WorkerPoolStats, WorkerStatus};
pub use processor::{JobContext, JobProcessor, ProgressCallback, WorkRequest};
pub use queue::{PriorityJobQueue, QueueStats};
pub use retry::{ErrorCategory, ErrorHandler, ErrorInfo, ErrorStatistics, RetryPolicy};
pub use scheduler::{CleanupReport, CompletionCallback, JobScheduler};
pub use service::{JobService, QueueStatus, INTERRUPTED_MESSAGE};
pub use tracker::{JobRecord, JobStateTracker};
pub use worker::{Worker, WorkerContext, WorkerEvent, WorkerHandle};
