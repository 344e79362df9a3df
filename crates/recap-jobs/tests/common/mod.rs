//! Shared fixtures for recap-jobs integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use recap_jobs::{
    CollectionMember, ContentOperations, Error, ItemMetadata, Job, JobKind, JobPriority,
    JobRecord, JobService, JobStatus, JobSystemConfig, JsonMap, Result, SchedulerConfig,
    SummaryCache, WorkerConfig,
};

/// Content operations backed by memory.
///
/// Inputs `item:<id>` resolve to items and `list:<id>` to collections with
/// three members. Scripted errors are returned by `fetch_content` in order
/// before the item starts succeeding.
#[derive(Default)]
pub struct MockOps {
    failures: Mutex<HashMap<String, VecDeque<Error>>>,
    content_delay: Option<Duration>,
    item_delays: HashMap<String, Duration>,
    pub content_fetches: AtomicUsize,
    pub summaries: AtomicUsize,
    pub cache_saves: AtomicUsize,
    saved_cache: Mutex<SummaryCache>,
}

impl MockOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self, item_id: &str, errors: Vec<Error>) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(item_id.to_string(), errors.into());
        }
        self
    }

    pub fn with_content_delay(mut self, delay: Duration) -> Self {
        self.content_delay = Some(delay);
        self
    }

    /// Delay content fetches for one item only.
    pub fn with_item_delay(mut self, item_id: &str, delay: Duration) -> Self {
        self.item_delays.insert(item_id.to_string(), delay);
        self
    }

    pub fn saved_entries(&self) -> usize {
        self.saved_cache.lock().unwrap().len()
    }
}

#[async_trait]
impl ContentOperations for MockOps {
    async fn resolve_item_id(&self, input: &str) -> Option<String> {
        input.strip_prefix("item:").map(String::from)
    }

    async fn resolve_collection_id(&self, input: &str) -> Option<String> {
        input.strip_prefix("list:").map(String::from)
    }

    async fn fetch_content(&self, item_id: &str) -> Result<Option<String>> {
        self.content_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self
            .item_delays
            .get(item_id)
            .copied()
            .or(self.content_delay)
        {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(item_id)
            .and_then(|errors| errors.pop_front());
        match scripted {
            Some(error) => Err(error),
            None => Ok(Some(format!("Transcript of {item_id}"))),
        }
    }

    async fn generate_summary(
        &self,
        text: &str,
        title: &str,
        _model: Option<&str>,
    ) -> Result<Option<String>> {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("{title}: {} chars", text.len())))
    }

    async fn fetch_metadata(&self, item_ids: &[String]) -> Result<HashMap<String, ItemMetadata>> {
        Ok(item_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    ItemMetadata {
                        title: format!("Video {id}"),
                        thumbnail: Some(format!("https://img.example.com/{id}.jpg")),
                    },
                )
            })
            .collect())
    }

    async fn fetch_collection_members(&self, collection_id: &str) -> Result<Vec<CollectionMember>> {
        Ok((1..=3)
            .map(|i| CollectionMember {
                id: format!("{collection_id}-{i}"),
                title: None,
            })
            .collect())
    }

    async fn load_cache(&self) -> Result<SummaryCache> {
        Ok(self.saved_cache.lock().unwrap().clone())
    }

    async fn save_cache(&self, cache: &SummaryCache) -> Result<()> {
        self.cache_saves.fetch_add(1, Ordering::SeqCst);
        let mut saved = self.saved_cache.lock().unwrap();
        for (key, value) in cache {
            saved.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

pub fn payload(value: JsonValue) -> JsonMap {
    match value {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    }
}

pub fn item_job(id: &str, input: &str, priority: JobPriority) -> Job {
    Job::with_id(id, JobKind::Item, payload(json!({ "url": input })), priority)
}

/// Fast-polling configuration with rate limiting disabled.
pub fn test_config(workers: usize) -> JobSystemConfig {
    JobSystemConfig::default()
        .with_workers(
            WorkerConfig::default()
                .with_worker_count(workers)
                .with_dequeue_timeout(Duration::from_millis(20))
                .with_health_check_interval(Duration::from_millis(100)),
        )
        .with_scheduler(SchedulerConfig::default().with_rate_limit(0))
}

/// Poll the tracker until `job_id` reaches `status`.
pub async fn wait_for_status(service: &JobService, job_id: &str, status: JobStatus) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = service.get_job_status(job_id).await {
            if record.status == status {
                return record;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "job {job_id} never reached {status}; last record: {:?}",
                service.get_job_status(job_id).await
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `condition` holds, failing the test after a few seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
