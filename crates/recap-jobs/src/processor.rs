//! Job processing: payload parsing and the item / collection / batch flows.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use recap_core::{
    defaults, ContentOperations, Error, Job, JobKind, Result, SummaryCache,
};

use crate::tracker::JobStateTracker;

/// Progress callback type for job processing.
pub type ProgressCallback = Box<dyn Fn(&Job) + Send + Sync>;

/// Context handed to the processor for one execution attempt.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    tracker: Option<Arc<JobStateTracker>>,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            tracker: None,
            progress_callback: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<JobStateTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Record progress on the job, the tracker and the callback.
    pub async fn report_progress(&mut self, progress: f64, step: &str) {
        self.job.update_progress(progress, step);

        if let Some(tracker) = &self.tracker {
            if let Err(e) = tracker
                .update_progress(&self.job.id, self.job.progress, None, Some(step), None)
                .await
            {
                debug!(job_id = %self.job.id, error = %e, "Progress not tracked");
            }
        }
        if let Some(callback) = &self.progress_callback {
            callback(&self.job);
        }
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

/// Typed view of a job payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkRequest {
    Item {
        input: String,
        model: Option<String>,
    },
    Collection {
        input: Option<String>,
        collection_id: Option<String>,
        member_ids: Vec<String>,
        model: Option<String>,
    },
    Batch {
        inputs: Vec<String>,
        model: Option<String>,
    },
}

impl WorkRequest {
    /// Parse a job's payload according to its kind.
    pub fn from_job(job: &Job) -> Result<Self> {
        let model = job.payload_str("model").map(String::from);
        let input = job
            .payload_str("url")
            .or_else(|| job.payload_str("input"))
            .filter(|s| !s.trim().is_empty())
            .map(String::from);

        match job.kind {
            JobKind::Item => {
                let input = input.ok_or_else(|| {
                    Error::InvalidInput("item job requires a 'url' or 'input'".into())
                })?;
                Ok(Self::Item { input, model })
            }
            JobKind::Collection => {
                let member_ids = string_list(job, "member_ids")?;
                let collection_id = job.payload_str("collection_id").map(String::from);
                if member_ids.is_empty() && collection_id.is_none() && input.is_none() {
                    return Err(Error::InvalidInput(
                        "collection job requires 'url', 'collection_id' or 'member_ids'".into(),
                    ));
                }
                Ok(Self::Collection {
                    input,
                    collection_id,
                    member_ids,
                    model,
                })
            }
            JobKind::Batch => {
                let inputs = string_list(job, "inputs")?;
                if inputs.is_empty() {
                    return Err(Error::InvalidInput(
                        "batch job requires a non-empty 'inputs' list".into(),
                    ));
                }
                Ok(Self::Batch { inputs, model })
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::Item { .. } => JobKind::Item,
            Self::Collection { .. } => JobKind::Collection,
            Self::Batch { .. } => JobKind::Batch,
        }
    }
}

fn string_list(job: &Job, key: &str) -> Result<Vec<String>> {
    match job.payload.get(key) {
        None | Some(JsonValue::Null) => Ok(Vec::new()),
        Some(JsonValue::Array(values)) => values
            .iter()
            .map(|v| {
                v.as_str()
                    .map(String::from)
                    .ok_or_else(|| Error::InvalidInput(format!("'{key}' must contain strings")))
            })
            .collect(),
        Some(_) => Err(Error::InvalidInput(format!("'{key}' must be a list"))),
    }
}

/// Slice of the job's progress range assigned to one unit of work.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: f64,
    width: f64,
}

impl Span {
    const FULL: Span = Span {
        start: 0.0,
        width: 1.0,
    };

    fn at(&self, fraction: f64) -> f64 {
        self.start + self.width * fraction
    }

    /// The `index`-th of `count` equal parts of this span, after `offset`.
    fn part(&self, offset: f64, index: usize, count: usize) -> Span {
        let width = self.width * (1.0 - offset) / count.max(1) as f64;
        Span {
            start: self.at(offset) + width * index as f64,
            width,
        }
    }
}

fn cache_key(item_id: &str, model: Option<&str>) -> String {
    format!("{item_id}:{}", model.unwrap_or(defaults::DEFAULT_MODEL))
}

/// Runs jobs against the content operations, with a cache private to its worker.
pub struct JobProcessor {
    ops: Arc<dyn ContentOperations>,
    cache: Mutex<SummaryCache>,
}

impl JobProcessor {
    pub fn new(ops: Arc<dyn ContentOperations>) -> Self {
        Self {
            ops,
            cache: Mutex::new(SummaryCache::new()),
        }
    }

    /// Replace the local cache with the shared cache store's contents.
    pub async fn load_cache(&self) -> usize {
        match self.ops.load_cache().await {
            Ok(loaded) => {
                let count = loaded.len();
                *self.cache.lock().await = loaded;
                count
            }
            Err(e) => {
                warn!(error = %e, "Failed to load summary cache, starting empty");
                0
            }
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Execute one attempt of the job in `ctx`.
    pub async fn process(&self, ctx: &mut JobContext, request: &WorkRequest) -> Result<JsonValue> {
        let result = match request {
            WorkRequest::Item { input, model } => {
                self.process_item(ctx, input, model.as_deref(), Span::FULL)
                    .await?
            }
            WorkRequest::Collection {
                input,
                collection_id,
                member_ids,
                model,
            } => {
                let (id, members) = if member_ids.is_empty() {
                    let id = match collection_id {
                        Some(id) => id.clone(),
                        None => self.resolve_collection(input.as_deref()).await?,
                    };
                    let members = self.collection_members(&id).await?;
                    (Some(id), members)
                } else {
                    (collection_id.clone(), member_ids.clone())
                };
                self.process_members(ctx, id, &members, model.as_deref(), Span::FULL)
                    .await?
            }
            WorkRequest::Batch { inputs, model } => {
                self.process_batch(ctx, inputs, model.as_deref()).await
            }
        };

        ctx.report_progress(1.0, "Done").await;
        Ok(result)
    }

    async fn resolve_collection(&self, input: Option<&str>) -> Result<String> {
        let input = input.unwrap_or_default();
        self.ops
            .resolve_collection_id(input)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("could not resolve collection from '{input}'")))
    }

    async fn collection_members(&self, collection_id: &str) -> Result<Vec<String>> {
        let members = self.ops.fetch_collection_members(collection_id).await?;
        if members.is_empty() {
            return Err(Error::ContentUnavailable(format!(
                "collection {collection_id} has no members"
            )));
        }
        Ok(members.into_iter().map(|m| m.id).collect())
    }

    async fn process_item(
        &self,
        ctx: &mut JobContext,
        input: &str,
        model: Option<&str>,
        span: Span,
    ) -> Result<JsonValue> {
        let item_id = self
            .ops
            .resolve_item_id(input)
            .await
            .ok_or_else(|| Error::InvalidInput(format!("could not resolve item from '{input}'")))?;
        ctx.report_progress(span.at(0.1), "Item resolved").await;

        self.summarize_item(ctx, &item_id, model, span).await
    }

    /// Summarize an already-resolved item, consulting the cache first.
    async fn summarize_item(
        &self,
        ctx: &mut JobContext,
        item_id: &str,
        model: Option<&str>,
        span: Span,
    ) -> Result<JsonValue> {
        let key = cache_key(item_id, model);

        let hit = self.cache.lock().await.get(&key).cloned();
        if let Some(mut cached) = hit {
            debug!(job_id = %ctx.job.id, item_id, "Summary cache hit");
            if let Some(obj) = cached.as_object_mut() {
                obj.insert("cached".into(), JsonValue::Bool(true));
            }
            ctx.report_progress(span.at(1.0), "Loaded from cache").await;
            return Ok(cached);
        }
        ctx.report_progress(span.at(0.2), "Cache checked").await;

        let metadata = self
            .ops
            .fetch_metadata(&[item_id.to_string()])
            .await?
            .remove(item_id)
            .unwrap_or_default();
        let title = if metadata.title.is_empty() {
            item_id.to_string()
        } else {
            metadata.title.clone()
        };
        ctx.report_progress(span.at(0.3), "Metadata fetched").await;

        let content = self.ops.fetch_content(item_id).await?.ok_or_else(|| {
            Error::ContentUnavailable(format!("no content available for {item_id}"))
        })?;
        ctx.report_progress(span.at(0.5), "Content fetched").await;

        let summary = self
            .ops
            .generate_summary(&content, &title, model)
            .await?
            .ok_or_else(|| Error::Model(format!("summary generation returned nothing for {item_id}")))?;
        ctx.report_progress(span.at(0.8), "Summary generated").await;

        let result = json!({
            "item_id": item_id,
            "title": title,
            "thumbnail": metadata.thumbnail,
            "summary": summary,
            "model": model.unwrap_or(defaults::DEFAULT_MODEL),
            "content_length": content.chars().count(),
            "generated_at": Utc::now().to_rfc3339(),
            "cached": false,
        });

        let snapshot = {
            let mut cache = self.cache.lock().await;
            cache.insert(key, result.clone());
            cache.clone()
        };
        if let Err(e) = self.ops.save_cache(&snapshot).await {
            warn!(job_id = %ctx.job.id, item_id, error = %e, "Failed to save summary cache");
        }
        ctx.report_progress(span.at(0.9), "Result cached").await;

        Ok(result)
    }

    /// Summarize each member in order. Fails only if every member failed.
    async fn process_members(
        &self,
        ctx: &mut JobContext,
        collection_id: Option<String>,
        members: &[String],
        model: Option<&str>,
        span: Span,
    ) -> Result<JsonValue> {
        ctx.report_progress(
            span.at(0.1),
            &format!("Found {} collection members", members.len()),
        )
        .await;

        let mut items = Vec::new();
        let mut errors = Vec::new();
        let mut first_error = None;

        for (index, member) in members.iter().enumerate() {
            let member_span = span.part(0.1, index, members.len());
            match self.summarize_item(ctx, member, model, member_span).await {
                Ok(result) => items.push(result),
                Err(e) => {
                    warn!(job_id = %ctx.job.id, item_id = %member, error = %e, "Collection member failed");
                    errors.push(json!({ "item_id": member, "error": e.to_string() }));
                    first_error.get_or_insert(e);
                }
            }
            trace!(job_id = %ctx.job.id, index, total = members.len(), "Member processed");
        }

        if items.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(json!({
            "collection_id": collection_id,
            "total": members.len(),
            "succeeded": items.len(),
            "failed": errors.len(),
            "items": items,
            "errors": errors,
        }))
    }

    /// Process each input as a collection when it resolves as one, else as
    /// an item. Failures are recorded per input.
    async fn process_batch(
        &self,
        ctx: &mut JobContext,
        inputs: &[String],
        model: Option<&str>,
    ) -> JsonValue {
        let mut results = Vec::with_capacity(inputs.len());
        let mut succeeded = 0usize;

        for (index, input) in inputs.iter().enumerate() {
            let span = Span::FULL.part(0.0, index, inputs.len());

            let (kind, outcome) = match self.ops.resolve_collection_id(input).await {
                Some(collection_id) => {
                    let outcome = match self.collection_members(&collection_id).await {
                        Ok(members) => {
                            self.process_members(ctx, Some(collection_id), &members, model, span)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    (JobKind::Collection, outcome)
                }
                None => (
                    JobKind::Item,
                    self.process_item(ctx, input, model, span).await,
                ),
            };

            match outcome {
                Ok(result) => {
                    succeeded += 1;
                    results.push(json!({
                        "input": input,
                        "kind": kind,
                        "success": true,
                        "result": result,
                    }));
                }
                Err(e) => {
                    warn!(job_id = %ctx.job.id, input = %input, error = %e, "Batch input failed");
                    results.push(json!({
                        "input": input,
                        "kind": kind,
                        "success": false,
                        "error": e.to_string(),
                    }));
                }
            }
            ctx.report_progress(span.at(1.0), &format!("Processed {} of {}", index + 1, inputs.len()))
                .await;
        }

        json!({
            "total": inputs.len(),
            "succeeded": succeeded,
            "failed": inputs.len() - succeeded,
            "results": results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recap_core::{CollectionMember, ItemMetadata, JobPriority, JsonMap};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeOps {
        summaries: AtomicUsize,
        saves: AtomicUsize,
        missing_content: Vec<String>,
    }

    #[async_trait]
    impl ContentOperations for FakeOps {
        async fn resolve_item_id(&self, input: &str) -> Option<String> {
            input.strip_prefix("item:").map(String::from)
        }

        async fn resolve_collection_id(&self, input: &str) -> Option<String> {
            input.strip_prefix("list:").map(String::from)
        }

        async fn fetch_content(&self, item_id: &str) -> Result<Option<String>> {
            if self.missing_content.iter().any(|m| m == item_id) {
                return Ok(None);
            }
            Ok(Some(format!("content of {item_id}")))
        }

        async fn generate_summary(
            &self,
            text: &str,
            _title: &str,
            _model: Option<&str>,
        ) -> Result<Option<String>> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("summary: {text}")))
        }

        async fn fetch_metadata(&self, item_ids: &[String]) -> Result<HashMap<String, ItemMetadata>> {
            Ok(item_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        ItemMetadata {
                            title: format!("Title {id}"),
                            thumbnail: None,
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
            Ok(SummaryCache::new())
        }

        async fn save_cache(&self, _cache: &SummaryCache) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(kind: JobKind, payload: JsonValue) -> Job {
        let payload = match payload {
            JsonValue::Object(map) => map,
            _ => JsonMap::new(),
        };
        let mut job = Job::new(kind, payload, JobPriority::Medium);
        job.start("worker-test");
        job
    }

    #[test]
    fn test_work_request_parsing() {
        let item = WorkRequest::from_job(&job(JobKind::Item, json!({"url": "item:a", "model": "m"})));
        assert_eq!(
            item.unwrap(),
            WorkRequest::Item {
                input: "item:a".into(),
                model: Some("m".into())
            }
        );

        assert!(matches!(
            WorkRequest::from_job(&job(JobKind::Item, json!({}))),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            WorkRequest::from_job(&job(JobKind::Batch, json!({"inputs": []}))),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            WorkRequest::from_job(&job(JobKind::Collection, json!({"member_ids": "nope"}))),
            Err(Error::InvalidInput(_))
        ));

        let collection = WorkRequest::from_job(&job(
            JobKind::Collection,
            json!({"member_ids": ["x", "y"]}),
        ))
        .unwrap();
        assert_eq!(collection.kind(), JobKind::Collection);
    }

    #[test]
    fn test_span_partitioning() {
        let second = Span::FULL.part(0.1, 1, 3);
        assert!((second.start - 0.4).abs() < 1e-9);
        assert!((second.width - 0.3).abs() < 1e-9);
        assert!((second.at(1.0) - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_item_summary_then_cache_hit() {
        let ops = Arc::new(FakeOps::default());
        let processor = JobProcessor::new(ops.clone());

        let first = job(JobKind::Item, json!({"url": "item:abc"}));
        let request = WorkRequest::from_job(&first).unwrap();
        let mut ctx = JobContext::new(first);
        let result = processor.process(&mut ctx, &request).await.unwrap();

        assert_eq!(result["item_id"], "abc");
        assert_eq!(result["title"], "Title abc");
        assert_eq!(result["cached"], false);
        assert_eq!(ctx.job.progress, 1.0);
        assert_eq!(ops.saves.load(Ordering::SeqCst), 1);

        let second = job(JobKind::Item, json!({"url": "item:abc"}));
        let mut ctx = JobContext::new(second);
        let cached = processor.process(&mut ctx, &request).await.unwrap();
        assert_eq!(cached["cached"], true);
        assert_eq!(ops.summaries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_milestones() {
        let processor = JobProcessor::new(Arc::new(FakeOps::default()));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();

        let job = job(JobKind::Item, json!({"input": "item:q"}));
        let request = WorkRequest::from_job(&job).unwrap();
        let mut ctx = JobContext::new(job).with_progress_callback(move |j: &Job| {
            sink.lock().unwrap().push(j.progress);
        });
        processor.process(&mut ctx, &request).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![0.1, 0.2, 0.3, 0.5, 0.8, 0.9, 1.0]);
    }

    #[tokio::test]
    async fn test_unresolvable_item_is_validation_error() {
        let processor = JobProcessor::new(Arc::new(FakeOps::default()));
        let job = job(JobKind::Item, json!({"url": "garbage"}));
        let request = WorkRequest::from_job(&job).unwrap();
        let mut ctx = JobContext::new(job);
        assert!(matches!(
            processor.process(&mut ctx, &request).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_collection_continues_past_member_failure() {
        let ops = Arc::new(FakeOps {
            missing_content: vec!["pl-2".into()],
            ..Default::default()
        });
        let processor = JobProcessor::new(ops);

        let job = job(JobKind::Collection, json!({"url": "list:pl"}));
        let request = WorkRequest::from_job(&job).unwrap();
        let mut ctx = JobContext::new(job);
        let result = processor.process(&mut ctx, &request).await.unwrap();

        assert_eq!(result["total"], 3);
        assert_eq!(result["succeeded"], 2);
        assert_eq!(result["failed"], 1);
        assert_eq!(result["errors"][0]["item_id"], "pl-2");
    }

    #[tokio::test]
    async fn test_collection_fails_when_every_member_fails() {
        let ops = Arc::new(FakeOps {
            missing_content: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        let processor = JobProcessor::new(ops);

        let job = job(JobKind::Collection, json!({"member_ids": ["a", "b"]}));
        let request = WorkRequest::from_job(&job).unwrap();
        let mut ctx = JobContext::new(job);
        assert!(matches!(
            processor.process(&mut ctx, &request).await,
            Err(Error::ContentUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_dispatches_by_input_shape() {
        let processor = JobProcessor::new(Arc::new(FakeOps::default()));
        let job = job(
            JobKind::Batch,
            json!({"inputs": ["item:one", "list:pl", "bogus"]}),
        );
        let request = WorkRequest::from_job(&job).unwrap();
        let mut ctx = JobContext::new(job);
        let result = processor.process(&mut ctx, &request).await.unwrap();

        assert_eq!(result["total"], 3);
        assert_eq!(result["succeeded"], 2);
        assert_eq!(result["results"][0]["kind"], "item");
        assert_eq!(result["results"][1]["kind"], "collection");
        assert_eq!(result["results"][1]["result"]["succeeded"], 3);
        assert_eq!(result["results"][2]["success"], false);
        assert_eq!(ctx.job.progress, 1.0);
    }
}
