//! Structured logging setup.
//!
//! Events carry the same field names across the queue, workers and event
//! push subsystems (`job_id`, `worker_id`, `client_id`, `kind`, `category`,
//! `attempt`, `duration_ms`) so log aggregation can query by them.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, retry scheduling, config choices |
//! | TRACE | Per-item iteration, per-event delivery |

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logging output settings, read from the environment.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `LOG_FORMAT` | `text` | `text` or `json` |
/// | `LOG_FILE` | unset | Enables daily-rotated file output at this path |
/// | `LOG_ANSI` | auto | Force ANSI colors on/off |
/// | `RUST_LOG` | `recap_jobs=info,recap_core=info` | Standard env filter |
#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    pub json: bool,
    pub file: Option<String>,
    pub ansi: Option<bool>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let json = std::env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let file = std::env::var("LOG_FILE").ok().filter(|v| !v.is_empty());
        let ansi = std::env::var("LOG_ANSI")
            .ok()
            .map(|v| v == "true" || v == "1");

        Self { json, file, ansi }
    }
}

/// Install the global tracing subscriber.
///
/// Returns the appender guard when file logging is enabled; the caller must
/// keep it alive for the lifetime of the process or buffered lines are lost.
pub fn init_tracing(settings: &LogSettings) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "recap_jobs=info,recap_core=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = settings.file {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("recap.log");
        let file_appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if settings.json {
            let _ = registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .try_init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(settings.ansi.unwrap_or(false));
            let _ = registry.with(layer).try_init();
        }
        Some(guard)
    } else {
        if settings.json {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = settings.ansi {
                layer = layer.with_ansi(ansi);
            }
            let _ = registry.with(layer).try_init();
        }
        None
    };

    tracing::info!(
        json = settings.json,
        log_file = settings.file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    guard
}
