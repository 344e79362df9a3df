//! Stream event types and the server-sent-events wire format.
//!
//! Every event pushed to a subscriber is a [`StreamEvent`]: an event kind, a
//! JSON object of payload fields, the emission timestamp, and the id of the
//! client it is addressed to.
//!
//! ## Wire Format (SSE)
//!
//! ```text
//! event: job_progress
//! data: {"job_id":"...","progress":0.5,"timestamp":"2026-...Z","client_id":"..."}
//!
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::JsonMap;

/// Kind of event pushed to streaming subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Sent once, right after a connection is registered.
    Connected,
    /// Heartbeat, also substituted when a read times out.
    Ping,
    JobQueued,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    /// A failed attempt that will be retried after a backoff delay.
    JobRetry,
    /// Operator/system message with a severity level.
    #[serde(rename = "message")]
    SystemMessage,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Connected,
        EventKind::Ping,
        EventKind::JobQueued,
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobRetry,
        EventKind::SystemMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Ping => "ping",
            EventKind::JobQueued => "job_queued",
            EventKind::JobStarted => "job_started",
            EventKind::JobProgress => "job_progress",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::JobRetry => "job_retry",
            EventKind::SystemMessage => "message",
        }
    }

    /// Connection-control events are delivered regardless of subscriptions.
    pub fn is_control(&self) -> bool {
        matches!(self, EventKind::Connected | EventKind::Ping)
    }

    /// Subscription set used when a client does not ask for specific kinds.
    pub fn default_subscriptions() -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|k| !k.is_control())
            .collect()
    }

    pub fn parse(name: &str) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a system message event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl MessageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageLevel::Info => "info",
            MessageLevel::Warning => "warning",
            MessageLevel::Error => "error",
        }
    }
}

/// One event queued for a streaming client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub data: JsonMap,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
}

impl StreamEvent {
    pub fn new(kind: EventKind, data: JsonMap, client_id: impl Into<String>) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            client_id: client_id.into(),
        }
    }

    pub fn ping(client_id: impl Into<String>) -> Self {
        Self::new(EventKind::Ping, JsonMap::new(), client_id)
    }

    /// Payload fields merged with `timestamp` and `client_id`.
    pub fn to_json(&self) -> JsonValue {
        let mut body = self.data.clone();
        body.insert(
            "timestamp".to_string(),
            JsonValue::String(self.timestamp.to_rfc3339()),
        );
        body.insert(
            "client_id".to_string(),
            JsonValue::String(self.client_id.clone()),
        );
        JsonValue::Object(body)
    }

    /// Render as one server-sent-events message.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind, self.to_json())
    }
}
