//! Bounded priority job queue.
//!
//! Jobs are ordered by `(priority, insertion sequence)`: higher priority
//! first, FIFO among equals. The backing store is a binary heap of
//! `(priority, seq, id)` keys plus an id → job map. Removal by id only
//! touches the map; the orphaned heap key is skipped when it surfaces and
//! [`PriorityJobQueue::compact`] drops orphans in bulk.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use recap_core::{Job, JobPriority};

type HeapKey = Reverse<(u8, u64, String)>;

struct QueueEntry {
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<HeapKey>,
    jobs: HashMap<String, QueueEntry>,
    next_seq: u64,
    total_enqueued: u64,
    total_dequeued: u64,
    total_removed: u64,
    total_rejected: u64,
}

impl QueueState {
    fn stale_entries(&self) -> usize {
        self.heap.len().saturating_sub(self.jobs.len())
    }

    fn pop_live(&mut self) -> Option<Job> {
        while let Some(Reverse((_, seq, id))) = self.heap.pop() {
            // A key is live only if its id is still mapped to the same insertion.
            let live = self.jobs.get(&id).is_some_and(|e| e.seq == seq);
            if live {
                if let Some(entry) = self.jobs.remove(&id) {
                    self.total_dequeued += 1;
                    return Some(entry.job);
                }
            }
            trace!(job_id = %id, "Skipping orphaned heap entry");
        }
        None
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub heap_entries: usize,
    pub stale_entries: usize,
    pub high_priority: usize,
    pub medium_priority: usize,
    pub low_priority: usize,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_removed: u64,
    pub total_rejected: u64,
}

/// Thread-safe bounded priority queue of pending jobs.
pub struct PriorityJobQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

impl PriorityJobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a job. Returns false without waiting when the queue is full or a
    /// job with the same id is already queued.
    pub async fn put(&self, job: Job) -> bool {
        let mut state = self.state.lock().await;

        if state.jobs.contains_key(&job.id) {
            state.total_rejected += 1;
            debug!(job_id = %job.id, "Rejected duplicate job id");
            return false;
        }
        if state.jobs.len() >= self.capacity {
            state.total_rejected += 1;
            debug!(job_id = %job.id, capacity = self.capacity, "Rejected job, queue full");
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .heap
            .push(Reverse((job.priority.value(), seq, job.id.clone())));
        state.jobs.insert(job.id.clone(), QueueEntry { seq, job });
        state.total_enqueued += 1;
        drop(state);

        self.available.notify_one();
        true
    }

    /// Take the highest-priority job, waiting up to `timeout` for one to arrive.
    pub async fn get(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.state.lock().await.pop_live() {
                return Some(job);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.state.lock().await.pop_live();
            }
        }
    }

    /// Remove a queued job by id. Its heap key stays behind until it is
    /// skipped or compacted away.
    pub async fn remove(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.jobs.remove(job_id).is_some() {
            state.total_removed += 1;
            true
        } else {
            false
        }
    }

    /// Clone of a queued job, if present.
    pub async fn peek(&self, job_id: &str) -> Option<Job> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|e| e.job.clone())
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Drop every queued job. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let dropped = state.jobs.len();
        state.jobs.clear();
        state.heap.clear();
        state.total_removed += dropped as u64;
        dropped
    }

    /// Share of heap keys that no longer point at a queued job.
    pub async fn stale_ratio(&self) -> f64 {
        let state = self.state.lock().await;
        if state.heap.is_empty() {
            0.0
        } else {
            state.stale_entries() as f64 / state.heap.len() as f64
        }
    }

    /// Rebuild the heap from the live jobs. Returns the number of orphaned
    /// keys dropped.
    pub async fn compact(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.heap.len();
        let heap: BinaryHeap<HeapKey> = state
            .jobs
            .iter()
            .map(|(id, e)| Reverse((e.job.priority.value(), e.seq, id.clone())))
            .collect();
        state.heap = heap;
        let dropped = before.saturating_sub(state.heap.len());
        if dropped > 0 {
            debug!(dropped, remaining = state.heap.len(), "Compacted job queue");
        }
        dropped
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let count = |p: JobPriority| state.jobs.values().filter(|e| e.job.priority == p).count();
        QueueStats {
            size: state.jobs.len(),
            capacity: self.capacity,
            heap_entries: state.heap.len(),
            stale_entries: state.stale_entries(),
            high_priority: count(JobPriority::High),
            medium_priority: count(JobPriority::Medium),
            low_priority: count(JobPriority::Low),
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            total_removed: state.total_removed,
            total_rejected: state.total_rejected,
        }
    }
}
