//! Error classification and retry policy engine.
//!
//! Failures are sorted into a small set of categories that decide how a job
//! is retried:
//!
//! | Class | Categories |
//! |-------|------------|
//! | retry soon | network, timeout |
//! | retry slowly | rate limit, quota |
//! | retry a little | content, model, system |
//! | never retry | validation |

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use recap_core::Error;

/// Failure category assigned by [`ErrorHandler::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The source has no usable content (missing transcript, private item).
    ContentUnavailable,
    RateLimit,
    Quota,
    Network,
    ModelError,
    System,
    Validation,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::ContentUnavailable,
        ErrorCategory::RateLimit,
        ErrorCategory::Quota,
        ErrorCategory::Network,
        ErrorCategory::ModelError,
        ErrorCategory::System,
        ErrorCategory::Validation,
        ErrorCategory::Timeout,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ContentUnavailable => "content_unavailable",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Network => "network",
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::System => "system",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered substring patterns; the first category with a match wins.
const PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::ContentUnavailable,
        &[
            "transcript",
            "no captions",
            "subtitles",
            "captions are disabled",
            "video unavailable",
            "private video",
            "content unavailable",
            "no content",
        ],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "rate-limit", "too many requests", "429", "throttl"],
    ),
    (
        ErrorCategory::Quota,
        &["quota", "billing", "insufficient_quota", "credit balance", "usage limit"],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection",
            "network",
            "dns",
            "unreachable",
            "refused",
            "reset by peer",
            "ssl",
            "socket",
        ],
    ),
    (
        ErrorCategory::ModelError,
        &[
            "model",
            "openai",
            "anthropic",
            "completion",
            "context length",
            "token limit",
            "generation failed",
        ],
    ),
    (
        ErrorCategory::System,
        &[
            "out of memory",
            "memory error",
            "disk",
            "no space left",
            "permission denied",
            "internal server error",
            "service unavailable",
            "502",
            "503",
            "database",
        ],
    ),
    (
        ErrorCategory::Validation,
        &[
            "invalid",
            "malformed",
            "missing required",
            "validation",
            "not a valid",
            "unsupported",
        ],
    ),
    (
        ErrorCategory::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
];

/// Backoff configuration for one category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Seconds before the first retry.
    pub base_delay: f64,
    /// Upper bound on the computed delay, in seconds.
    pub max_delay: f64,
    pub backoff_multiplier: f64,
    /// Perturb delays by a uniform ±25%.
    pub jitter: bool,
    pub retry_eligible: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: f64, max_delay: f64, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff_multiplier: multiplier,
            jitter: true,
            retry_eligible: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn never() -> Self {
        Self {
            max_retries: 0,
            base_delay: 0.0,
            max_delay: 0.0,
            backoff_multiplier: 1.0,
            jitter: false,
            retry_eligible: false,
        }
    }

    /// Default policy table.
    pub fn default_for(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::ContentUnavailable => Self::new(3, 5.0, 300.0, 2.0),
            ErrorCategory::RateLimit => Self::new(5, 60.0, 3600.0, 2.0),
            ErrorCategory::Quota => Self::new(1, 3600.0, 3600.0, 1.0).without_jitter(),
            ErrorCategory::Network => Self::new(4, 10.0, 600.0, 2.0),
            ErrorCategory::ModelError => Self::new(2, 30.0, 300.0, 2.0),
            ErrorCategory::System => Self::new(3, 15.0, 600.0, 2.0),
            ErrorCategory::Validation => Self::never(),
            ErrorCategory::Timeout => Self::new(3, 30.0, 900.0, 1.5),
            ErrorCategory::Unknown => Self::new(2, 60.0, 600.0, 2.0),
        }
    }

    /// Delay before retry number `retry_count + 1`, without jitter.
    pub fn backoff(&self, retry_count: u32) -> f64 {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = self.base_delay * self.backoff_multiplier.powi(exponent);
        if delay.is_finite() {
            delay.min(self.max_delay)
        } else {
            self.max_delay
        }
    }
}

/// Everything known about one failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retry_eligible: bool,
    /// Seconds to wait before retrying; zero when not eligible.
    pub retry_delay: f64,
    pub max_retries: u32,
    pub job_id: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ErrorInfo {
    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay.max(0.0))
    }
}

/// Aggregated error counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub by_category: HashMap<ErrorCategory, u64>,
    /// Most frequent categories, highest count first.
    pub top_categories: Vec<(ErrorCategory, u64)>,
    pub last_error_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsState {
    total: u64,
    by_category: HashMap<ErrorCategory, u64>,
    last_error_at: Option<DateTime<Utc>>,
}

/// Classifies failures and computes retry decisions.
pub struct ErrorHandler {
    policies: RwLock<HashMap<ErrorCategory, RetryPolicy>>,
    stats: RwLock<StatsState>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    const TOP_CATEGORIES: usize = 5;

    pub fn new() -> Self {
        let policies = ErrorCategory::ALL
            .into_iter()
            .map(|c| (c, RetryPolicy::default_for(c)))
            .collect();
        Self {
            policies: RwLock::new(policies),
            stats: RwLock::new(StatsState::default()),
        }
    }

    /// Map an error to a category from its message (and optional context),
    /// falling back to the error variant.
    pub fn classify(&self, error: &Error, context: Option<&str>) -> ErrorCategory {
        let mut haystack = error.to_string().to_lowercase();
        if let Some(context) = context {
            haystack.push(' ');
            haystack.push_str(&context.to_lowercase());
        }

        for (category, patterns) in PATTERNS {
            if patterns.iter().any(|p| haystack.contains(p)) {
                return *category;
            }
        }

        match error {
            Error::Timeout(_) => ErrorCategory::Timeout,
            Error::Network(_) => ErrorCategory::Network,
            Error::InvalidInput(_) | Error::Serialization(_) => ErrorCategory::Validation,
            Error::RateLimited(_) => ErrorCategory::RateLimit,
            Error::QuotaExceeded(_) => ErrorCategory::Quota,
            Error::ContentUnavailable(_) => ErrorCategory::ContentUnavailable,
            Error::Model(_) => ErrorCategory::ModelError,
            Error::System(_) | Error::Io(_) => ErrorCategory::System,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Classify a failure, record it, and decide whether and when to retry.
    pub fn handle(
        &self,
        error: &Error,
        job_id: &str,
        retry_count: u32,
        context: Option<&str>,
    ) -> ErrorInfo {
        let category = self.classify(error, context);
        let policy = self.retry_policy(category);

        let retry_eligible = policy.retry_eligible && retry_count < policy.max_retries;
        let retry_delay = if retry_eligible {
            let delay = policy.backoff(retry_count);
            if policy.jitter {
                let factor = rand::thread_rng().gen_range(-0.25..=0.25);
                (delay * (1.0 + factor)).max(0.0)
            } else {
                delay
            }
        } else {
            0.0
        };

        self.record(category);

        let info = ErrorInfo {
            category,
            message: error.to_string(),
            timestamp: Utc::now(),
            retry_eligible,
            retry_delay,
            max_retries: policy.max_retries,
            job_id: job_id.to_string(),
            attempt: retry_count,
            context: context.map(String::from),
        };

        if retry_eligible {
            debug!(
                job_id,
                category = %category,
                attempt = retry_count,
                retry_delay,
                "Error is retryable"
            );
        } else {
            warn!(
                job_id,
                category = %category,
                attempt = retry_count,
                error = %info.message,
                "Error is not retryable"
            );
        }

        info
    }

    pub fn retry_policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies
            .read()
            .ok()
            .and_then(|p| p.get(&category).copied())
            .unwrap_or_else(|| RetryPolicy::default_for(category))
    }

    /// Replace the policy for one category at runtime.
    pub fn update_retry_policy(&self, category: ErrorCategory, policy: RetryPolicy) {
        if let Ok(mut policies) = self.policies.write() {
            policies.insert(category, policy);
            debug!(category = %category, ?policy, "Retry policy updated");
        }
    }

    pub fn get_statistics(&self) -> ErrorStatistics {
        let Ok(stats) = self.stats.read() else {
            return ErrorStatistics::default();
        };

        let mut top: Vec<(ErrorCategory, u64)> =
            stats.by_category.iter().map(|(c, n)| (*c, *n)).collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        top.truncate(Self::TOP_CATEGORIES);

        ErrorStatistics {
            total_errors: stats.total,
            by_category: stats.by_category.clone(),
            top_categories: top,
            last_error_at: stats.last_error_at,
        }
    }

    pub fn reset_statistics(&self) {
        if let Ok(mut stats) = self.stats.write() {
            *stats = StatsState::default();
        }
    }

    fn record(&self, category: ErrorCategory) {
        if let Ok(mut stats) = self.stats.write() {
            stats.total += 1;
            *stats.by_category.entry(category).or_insert(0) += 1;
            stats.last_error_at = Some(Utc::now());
        }
    }
}
