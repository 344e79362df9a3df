//! Durable job state tracker.
//!
//! Holds one [`JobRecord`] per job id behind a single lock and, when a state
//! file is configured, snapshots the whole map after every write. Snapshots
//! are written to a temporary file in the target directory and atomically
//! renamed over the target, so readers of the file never see a partial
//! write. The snapshot is serialized under the read lock and written after
//! it is released.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use recap_core::{Error, Job, JobKind, JobPriority, JobStatus, Result};

use crate::config::TrackerConfig;

/// Persisted status of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            priority: job.priority,
            status: job.status,
            progress: job.progress,
            current_step: job.current_step.clone(),
            message: job.current_step.clone(),
            error_message: job.error_message.clone(),
            result: job.result.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            worker_id: job.worker_id.clone(),
            client_id: job.client_id.clone(),
            session_id: job.session_id.clone(),
            created_at: job.created_at,
            updated_at: Utc::now(),
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }

    /// Time the record became terminal, falling back to its last update.
    fn finished_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.updated_at)
    }
}

struct TrackerState {
    records: HashMap<String, JobRecord>,
    last_cleanup: Instant,
}

/// Thread-safe job id → record map with durable snapshots and retention cleanup.
pub struct JobStateTracker {
    state: RwLock<TrackerState>,
    // Serializes snapshot writers so an older snapshot never lands last.
    persist_lock: Mutex<()>,
    config: TrackerConfig,
}

impl JobStateTracker {
    /// In-memory tracker with default retention.
    pub fn in_memory() -> Self {
        Self::with_records(HashMap::new(), TrackerConfig::default())
    }

    /// Open a tracker, restoring the snapshot at `config.state_file` if one
    /// exists. A missing or unreadable snapshot starts from an empty store.
    pub async fn open(config: TrackerConfig) -> Self {
        let records = match config.state_file.as_deref() {
            Some(path) => Self::load_snapshot(path).await,
            None => HashMap::new(),
        };
        Self::with_records(records, config)
    }

    fn with_records(records: HashMap<String, JobRecord>, config: TrackerConfig) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                records,
                last_cleanup: Instant::now(),
            }),
            persist_lock: Mutex::new(()),
            config,
        }
    }

    async fn load_snapshot(path: &Path) -> HashMap<String, JobRecord> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No job state snapshot, starting empty");
                return HashMap::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read job state snapshot, starting empty");
                return HashMap::new();
            }
        };

        match serde_json::from_slice::<HashMap<String, JobRecord>>(&bytes) {
            Ok(records) => {
                info!(path = %path.display(), count = records.len(), "Restored job state");
                records
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt job state snapshot, starting empty");
                HashMap::new()
            }
        }
    }

    /// Insert or overwrite the record for `job`.
    pub async fn track(&self, job: &Job) {
        {
            let mut state = self.state.write().await;
            let mut record = JobRecord::from_job(job);
            if let Some(existing) = state.records.get(&job.id) {
                // Keep the richer progress message set through update_progress.
                if record.message.is_none() {
                    record.message = existing.message.clone();
                }
            }
            state.records.insert(job.id.clone(), record);
            self.maybe_cleanup(&mut state);
        }
        self.persist_logged().await;
    }

    /// Update progress (and optionally status, message, error) of a job.
    ///
    /// Fails for progress outside [0, 1] and for unknown ids. While a job is
    /// in progress its stored progress never decreases.
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: f64,
        status: Option<JobStatus>,
        message: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(Error::InvalidInput(format!(
                "progress must be within [0, 1], got {progress}"
            )));
        }

        {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;

            let now = Utc::now();
            if let Some(status) = status {
                if status == JobStatus::InProgress && record.started_at.is_none() {
                    record.started_at = Some(now);
                }
                if status.is_terminal() {
                    record.completed_at.get_or_insert(now);
                } else {
                    record.completed_at = None;
                }
                record.status = status;
            }

            record.progress = if record.status == JobStatus::InProgress {
                record.progress.max(progress)
            } else {
                progress
            };
            if let Some(message) = message {
                record.message = Some(message.to_string());
                record.current_step = Some(message.to_string());
            }
            if let Some(error) = error {
                record.error_message = Some(error.to_string());
            }
            record.updated_at = now;

            self.maybe_cleanup(&mut state);
        }

        self.persist_logged().await;
        Ok(())
    }

    /// Copy of a job's record.
    pub async fn get_status(&self, job_id: &str) -> Option<JobRecord> {
        self.state.read().await.records.get(job_id).cloned()
    }

    /// All records, optionally filtered by status, newest first.
    pub async fn get_all(&self, status_filter: Option<JobStatus>) -> Vec<JobRecord> {
        let state = self.state.read().await;
        let mut records: Vec<JobRecord> = state
            .records
            .values()
            .filter(|r| status_filter.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    pub async fn delete(&self, job_id: &str) -> bool {
        let removed = self.state.write().await.records.remove(job_id).is_some();
        if removed {
            self.persist_logged().await;
        }
        removed
    }

    /// Mark every active record FAILED with `reason`. Used after a restart,
    /// when no queue or worker holds those jobs any more. Returns how many
    /// records changed.
    pub async fn fail_interrupted(&self, reason: &str) -> usize {
        let failed = {
            let mut state = self.state.write().await;
            let now = Utc::now();
            let mut failed = 0;
            for record in state.records.values_mut().filter(|r| r.status.is_active()) {
                record.status = JobStatus::Failed;
                record.error_message = Some(reason.to_string());
                record.message = Some(reason.to_string());
                record.worker_id = None;
                record.completed_at = Some(now);
                record.updated_at = now;
                failed += 1;
            }
            failed
        };
        if failed > 0 {
            warn!(count = failed, "Marked interrupted jobs as failed");
            self.persist_logged().await;
        }
        failed
    }

    /// Bump a job's retry counter, returning the new value.
    pub async fn increment_retry_count(&self, job_id: &str) -> Result<u32> {
        let count = {
            let mut state = self.state.write().await;
            let record = state
                .records
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
            record.retry_count += 1;
            record.updated_at = Utc::now();
            record.retry_count
        };
        self.persist_logged().await;
        Ok(count)
    }

    /// Jobs that are pending, in progress, or waiting to retry.
    pub async fn get_active_count(&self) -> usize {
        self.state
            .read()
            .await
            .records
            .values()
            .filter(|r| r.status.is_active())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove completed/failed records older than the retention window.
    /// Active records are kept regardless of age.
    pub async fn cleanup_expired(&self) -> usize {
        let removed = {
            let mut state = self.state.write().await;
            let removed = Self::remove_expired(&mut state, self.config.retention);
            state.last_cleanup = Instant::now();
            removed
        };
        if removed > 0 {
            self.persist_logged().await;
        }
        removed
    }

    fn maybe_cleanup(&self, state: &mut TrackerState) {
        if state.last_cleanup.elapsed() < self.config.cleanup_interval {
            return;
        }
        state.last_cleanup = Instant::now();
        Self::remove_expired(state, self.config.retention);
    }

    fn remove_expired(state: &mut TrackerState, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let before = state.records.len();
        state
            .records
            .retain(|_, r| !(r.status.is_terminal() && r.finished_at() < cutoff));
        let removed = before - state.records.len();
        if removed > 0 {
            info!(removed, "Removed expired job records");
        }
        removed
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist job state");
        }
    }

    /// Write the current snapshot to the state file, if configured.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = self.config.state_file.clone() else {
            return Ok(());
        };

        let _writer = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&state.records)?
        };

        tokio::task::spawn_blocking(move || write_atomic(&path, &snapshot))
            .await
            .map_err(|e| Error::Internal(format!("snapshot writer panicked: {e}")))?
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.config.state_file.as_deref()
    }

    pub fn retention(&self) -> chrono::Duration {
        self.config.retention
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }
}

/// Write `bytes` next to `path` and rename the temp file over it.
fn write_atomic(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recap_core::JsonMap;
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job::with_id(id, JobKind::Item, JsonMap::new(), JobPriority::Medium)
    }

    #[tokio::test]
    async fn test_track_and_get_status() {
        let tracker = JobStateTracker::in_memory();
        tracker.track(&job("a")).await;

        let record = tracker.get_status("a").await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.progress, 0.0);
        assert!(tracker.get_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_update_progress_validates_range() {
        let tracker = JobStateTracker::in_memory();
        tracker.track(&job("a")).await;

        assert!(matches!(
            tracker.update_progress("a", 1.5, None, None, None).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            tracker.update_progress("a", -0.1, None, None, None).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            tracker.update_progress("nope", 0.5, None, None, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_monotonic_while_in_progress() {
        let tracker = JobStateTracker::in_memory();
        tracker.track(&job("a")).await;
        tracker
            .update_progress("a", 0.2, Some(JobStatus::InProgress), Some("resolved"), None)
            .await
            .unwrap();
        tracker
            .update_progress("a", 0.6, None, Some("content fetched"), None)
            .await
            .unwrap();
        tracker.update_progress("a", 0.4, None, None, None).await.unwrap();

        let record = tracker.get_status("a").await.unwrap();
        assert_eq!(record.progress, 0.6);
        assert_eq!(record.message.as_deref(), Some("content fetched"));
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_sets_completed_at() {
        let tracker = JobStateTracker::in_memory();
        tracker.track(&job("a")).await;
        tracker
            .update_progress("a", 1.0, Some(JobStatus::Failed), None, Some("boom"))
            .await
            .unwrap();

        let record = tracker.get_status("a").await.unwrap();
        assert!(record.completed_at.is_some());
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_get_all_filters_and_sorts_newest_first() {
        let tracker = JobStateTracker::in_memory();
        let mut old = job("old");
        old.created_at = Utc::now() - chrono::Duration::minutes(5);
        let mut done = job("done");
        done.complete_successfully(json!({}));

        tracker.track(&old).await;
        tracker.track(&job("new")).await;
        tracker.track(&done).await;

        let all = tracker.get_all(None).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all.last().unwrap().job_id, "old");

        let pending = tracker.get_all(Some(JobStatus::Pending)).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(tracker.get_active_count().await, 2);
    }

    #[tokio::test]
    async fn test_delete_and_increment_retry() {
        let tracker = JobStateTracker::in_memory();
        tracker.track(&job("a")).await;
        assert_eq!(tracker.increment_retry_count("a").await.unwrap(), 1);
        assert_eq!(tracker.increment_retry_count("a").await.unwrap(), 2);
        assert!(tracker.increment_retry_count("zzz").await.is_err());

        assert!(tracker.delete("a").await);
        assert!(!tracker.delete("a").await);
        assert!(tracker.is_empty().await);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_active_records() {
        let tracker = JobStateTracker::in_memory();
        let long_ago = Utc::now() - chrono::Duration::hours(48);

        let mut finished = job("finished");
        finished.complete_successfully(json!({}));
        finished.completed_at = Some(long_ago);

        let mut ancient_pending = job("pending");
        ancient_pending.created_at = long_ago;

        let mut recent = job("recent");
        recent.fail_with_error("boom", false);

        tracker.track(&finished).await;
        tracker.track(&ancient_pending).await;
        tracker.track(&recent).await;

        assert_eq!(tracker.cleanup_expired().await, 1);
        assert!(tracker.get_status("finished").await.is_none());
        assert!(tracker.get_status("pending").await.is_some());
        assert!(tracker.get_status("recent").await.is_some());
    }

    #[tokio::test]
    async fn test_fail_interrupted_closes_active_records() {
        let tracker = JobStateTracker::in_memory();
        let mut running = job("running");
        running.start("worker-2");
        let mut retrying = job("retrying");
        retrying.fail_with_error("connection reset", true);
        let mut done = job("done");
        done.complete_successfully(json!({}));

        for j in [&job("pending"), &running, &retrying, &done] {
            tracker.track(j).await;
        }

        assert_eq!(tracker.fail_interrupted("interrupted").await, 3);
        assert_eq!(tracker.get_active_count().await, 0);

        let record = tracker.get_status("running").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("interrupted"));
        assert!(record.completed_at.is_some());
        assert!(record.worker_id.is_none());
        assert_eq!(
            tracker.get_status("done").await.unwrap().status,
            JobStatus::Completed
        );

        // Nothing left to close.
        assert_eq!(tracker.fail_interrupted("interrupted").await, 0);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.json");
        let config = TrackerConfig::default().with_state_file(&path);

        let tracker = JobStateTracker::open(config.clone()).await;
        for i in 0..5 {
            let mut j = job(&format!("job-{i}"));
            j.payload.insert("url".into(), json!(format!("https://e.com/{i}")));
            if i % 2 == 0 {
                j.start("worker-1");
                j.update_progress(0.5, "content fetched");
            }
            tracker.track(&j).await;
        }
        tracker
            .update_progress("job-1", 0.25, Some(JobStatus::InProgress), Some("resolved"), None)
            .await
            .unwrap();

        let original = tracker.get_all(None).await;
        let reloaded = JobStateTracker::open(config).await.get_all(None).await;
        assert_eq!(reloaded.len(), 5);

        let by_id = |records: &[JobRecord]| -> HashMap<String, JobRecord> {
            records.iter().map(|r| (r.job_id.clone(), r.clone())).collect()
        };
        assert_eq!(by_id(&original), by_id(&reloaded));

        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(parsed["job-0"]["created_at"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let tracker = JobStateTracker::open(TrackerConfig::default().with_state_file(&path)).await;
        assert!(tracker.is_empty().await);

        // The next write replaces the corrupt file with a valid snapshot.
        tracker.track(&job("fresh")).await;
        let reloaded = JobStateTracker::open(TrackerConfig::default().with_state_file(&path)).await;
        assert!(reloaded.get_status("fresh").await.is_some());
    }
}
