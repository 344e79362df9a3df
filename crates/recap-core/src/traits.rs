//! Collaborator traits the job core calls but never implements.
//!
//! The worker pool performs no network or storage work of its own: resolving
//! identifiers, fetching content, generating summaries and loading/saving the
//! result cache all go through [`ContentOperations`], injected at startup.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Result;

/// Descriptive metadata for one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// One member of a collection, as returned by the collection pager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionMember {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Result cache keyed by `"<item_id>:<model>"`.
pub type SummaryCache = HashMap<String, JsonValue>;

/// Domain operations used by workers to do the actual work of a job.
///
/// Implementations may perform blocking network I/O inside the async methods;
/// that cost is opaque to the job core. Methods returning `Ok(None)` mean
/// "nothing available" without an underlying error.
#[async_trait]
pub trait ContentOperations: Send + Sync {
    /// Extract an item identifier from free-form input (URL or bare id).
    async fn resolve_item_id(&self, input: &str) -> Option<String>;

    /// Extract a collection identifier from free-form input.
    async fn resolve_collection_id(&self, input: &str) -> Option<String>;

    /// Fetch the textual content of an item.
    async fn fetch_content(&self, item_id: &str) -> Result<Option<String>>;

    /// Generate a natural-language summary of `text`.
    async fn generate_summary(
        &self,
        text: &str,
        title: &str,
        model: Option<&str>,
    ) -> Result<Option<String>>;

    /// Fetch metadata for a set of items.
    async fn fetch_metadata(&self, item_ids: &[String]) -> Result<HashMap<String, ItemMetadata>>;

    /// Page through a collection and return all of its members.
    async fn fetch_collection_members(&self, collection_id: &str)
        -> Result<Vec<CollectionMember>>;

    /// Load the shared result cache.
    async fn load_cache(&self) -> Result<SummaryCache>;

    /// Persist the shared result cache.
    async fn save_cache(&self, cache: &SummaryCache) -> Result<()>;
}
