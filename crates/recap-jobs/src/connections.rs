//! Event push to streaming clients.
//!
//! Each client owns a bounded outbound queue. Producers never block: when a
//! client's queue is full the event is dropped for that client and counted
//! as a failed delivery. A heartbeat task pings quiet clients and drops ones
//! that stopped reading.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use recap_core::{
    defaults, Error, EventKind, Job, JobResult, JobStatus, JsonMap, MessageLevel, Result,
    StreamEvent,
};

use crate::config::{ConnectionConfig, MIN_TICK};

fn to_map(value: JsonValue) -> JsonMap {
    match value {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    }
}

/// One streaming client.
pub struct Connection {
    client_id: String,
    subscriptions: HashSet<EventKind>,
    tx: mpsc::Sender<StreamEvent>,
    rx: tokio::sync::Mutex<mpsc::Receiver<StreamEvent>>,
    capacity: usize,
    active: AtomicBool,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl Connection {
    fn new(client_id: String, subscriptions: HashSet<EventKind>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let now = Instant::now();
        Self {
            client_id,
            subscriptions,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            capacity,
            active: AtomicBool::new(true),
            created_at: now,
            last_activity: Mutex::new(now),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscriptions(&self) -> &HashSet<EventKind> {
        &self.subscriptions
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Control events (connected, ping) are always delivered.
    pub fn is_subscribed(&self, kind: EventKind) -> bool {
        kind.is_control() || self.subscriptions.contains(&kind)
    }

    /// Enqueue an event without waiting. Returns false when the connection
    /// is closed or its queue is full.
    pub fn send_event(&self, event: StreamEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        match self.tx.try_send(event) {
            Ok(()) => {
                self.events_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %self.client_id, kind = %event.kind, "Event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Wait up to `timeout` for an event, then drain whatever else is ready.
    /// Returns a single ping when nothing arrived in time.
    pub async fn get_events(&self, timeout: Duration) -> Vec<StreamEvent> {
        if !self.is_active() {
            return Vec::new();
        }
        self.touch();

        let mut rx = self.rx.lock().await;
        let events = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(first)) => {
                let mut events = vec![first];
                while events.len() < defaults::EVENT_BATCH_MAX {
                    match rx.try_recv() {
                        Ok(event) => events.push(event),
                        Err(_) => break,
                    }
                }
                events
            }
            Ok(None) => Vec::new(),
            Err(_) if self.is_active() => vec![StreamEvent::ping(self.client_id.clone())],
            Err(_) => Vec::new(),
        };
        drop(rx);

        self.touch();
        trace!(client_id = %self.client_id, count = events.len(), "Events read");
        events
    }

    pub fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "Connection closed");
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Events waiting to be read.
    pub fn queued_events(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }
}

/// Delivery counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
    pub filtered: usize,
    pub total: usize,
}

/// What a heartbeat pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub client_id: String,
    pub subscriptions: Vec<EventKind>,
    pub queued_events: usize,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub age_secs: f64,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub max_connections: usize,
    pub total_connections: u64,
    pub total_broadcasts: u64,
    pub total_events_sent: u64,
    pub total_events_failed: u64,
    pub average_age_secs: f64,
    pub max_age_secs: f64,
    pub average_idle_secs: f64,
    pub max_idle_secs: f64,
    /// Number of open connections subscribed to each event kind.
    pub subscriptions: HashMap<EventKind, usize>,
    pub connections: Vec<ConnectionInfo>,
}

/// Registry of streaming clients plus the heartbeat task.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    total_connections: AtomicU64,
    total_broadcasts: AtomicU64,
    total_sent: AtomicU64,
    total_failed: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            shutdown_tx,
            heartbeat: Mutex::new(None),
            total_connections: AtomicU64::new(0),
            total_broadcasts: AtomicU64::new(0),
            total_sent: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start the heartbeat task. Calling it again while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.heartbeat.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let manager = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = self.config.heartbeat_interval.max(MIN_TICK);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let report = manager.heartbeat_tick();
                        if report.removed > 0 || report.pinged > 0 {
                            debug!(pinged = report.pinged, removed = report.removed, "Heartbeat");
                        }
                    }
                }
            }
            debug!("Heartbeat task stopped");
        }));
        info!(interval_secs = interval.as_secs(), "Connection heartbeat started");
    }

    /// Stop the heartbeat task and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.heartbeat.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
        let closed = self.close_all();
        info!(closed, "Connection manager stopped");
    }

    /// Register a client. A missing id gets a fresh one; an existing id is
    /// replaced. Fails once the connection limit is reached.
    pub fn add_connection(
        &self,
        client_id: Option<String>,
        subscriptions: Option<HashSet<EventKind>>,
    ) -> Result<Arc<Connection>> {
        let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let subscriptions = subscriptions
            .unwrap_or_else(|| EventKind::default_subscriptions().into_iter().collect());

        let connection = Arc::new(Connection::new(
            client_id.clone(),
            subscriptions,
            self.config.queue_capacity,
        ));

        {
            let mut connections = self
                .connections
                .write()
                .map_err(|_| Error::Internal("connection registry poisoned".into()))?;
            match connections.get(&client_id) {
                Some(existing) => {
                    existing.close();
                    debug!(client_id = %client_id, "Replacing existing connection");
                }
                None if connections.len() >= self.config.max_connections => {
                    warn!(max = self.config.max_connections, "Connection limit reached");
                    return Err(Error::ConnectionLimit(format!(
                        "maximum connections ({}) reached",
                        self.config.max_connections
                    )));
                }
                None => {}
            }
            connections.insert(client_id.clone(), connection.clone());
        }
        self.total_connections.fetch_add(1, Ordering::Relaxed);

        let mut subscribed: Vec<&str> = connection.subscriptions.iter().map(|k| k.as_str()).collect();
        subscribed.sort_unstable();
        connection.send_event(StreamEvent::new(
            EventKind::Connected,
            to_map(json!({
                "message": "Connected to job event stream",
                "subscriptions": subscribed,
            })),
            client_id.clone(),
        ));

        info!(client_id = %client_id, "Client connected");
        Ok(connection)
    }

    pub fn remove_connection(&self, client_id: &str) -> bool {
        let removed = self
            .connections
            .write()
            .ok()
            .and_then(|mut c| c.remove(client_id));
        match removed {
            Some(connection) => {
                connection.close();
                info!(client_id, "Client disconnected");
                true
            }
            None => false,
        }
    }

    pub fn get_connection(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().ok()?.get(client_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Send an event to every subscribed client that passes `filter`.
    pub fn broadcast(
        &self,
        kind: EventKind,
        data: JsonMap,
        filter: Option<&dyn Fn(&Connection) -> bool>,
    ) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        for connection in self.snapshot() {
            outcome.total += 1;
            let wanted = connection.is_subscribed(kind) && filter.map_or(true, |f| f(&connection));
            if !wanted {
                outcome.filtered += 1;
                continue;
            }
            let event = StreamEvent::new(kind, data.clone(), connection.client_id.clone());
            if connection.send_event(event) {
                outcome.sent += 1;
            } else {
                outcome.failed += 1;
            }
        }

        self.total_broadcasts.fetch_add(1, Ordering::Relaxed);
        self.total_sent.fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.total_failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        trace!(kind = %kind, sent = outcome.sent, failed = outcome.failed, "Broadcast");
        outcome
    }

    /// Send an event to one client, ignoring its subscriptions.
    pub fn send_to_client(&self, client_id: &str, kind: EventKind, data: JsonMap) -> bool {
        match self.get_connection(client_id) {
            Some(connection) => connection.send_event(StreamEvent::new(kind, data, client_id)),
            None => false,
        }
    }

    pub fn broadcast_system_message(&self, message: &str, level: MessageLevel) -> BroadcastOutcome {
        self.broadcast(
            EventKind::SystemMessage,
            to_map(json!({ "message": message, "level": level })),
            None,
        )
    }

    pub fn notify_job_queued(&self, job: &Job) -> BroadcastOutcome {
        self.broadcast(
            EventKind::JobQueued,
            to_map(json!({
                "job_id": job.id,
                "kind": job.kind,
                "priority": job.priority,
                "status": job.status,
                "total_steps": job.total_steps,
            })),
            None,
        )
    }

    pub fn notify_job_started(&self, job_id: &str, worker_id: &str) -> BroadcastOutcome {
        self.broadcast(
            EventKind::JobStarted,
            to_map(json!({ "job_id": job_id, "worker_id": worker_id })),
            None,
        )
    }

    pub fn notify_job_progress(
        &self,
        job_id: &str,
        progress: f64,
        step: Option<&str>,
    ) -> BroadcastOutcome {
        self.broadcast(
            EventKind::JobProgress,
            to_map(json!({ "job_id": job_id, "progress": progress, "step": step })),
            None,
        )
    }

    /// Push the outcome of an execution attempt: completed, retry or failed.
    pub fn notify_job_finished(&self, job: &Job, result: &JobResult) -> BroadcastOutcome {
        let kind = match job.status {
            JobStatus::Completed => EventKind::JobCompleted,
            JobStatus::Retry => EventKind::JobRetry,
            _ => EventKind::JobFailed,
        };
        let mut data = to_map(json!({
            "job_id": job.id,
            "kind": job.kind,
            "status": job.status,
            "success": result.success,
            "retry_count": job.retry_count,
            "max_retries": job.max_retries,
            "processing_time_seconds": result.processing_time_seconds,
        }));
        if let Some(result_data) = &result.data {
            data.insert("result".into(), result_data.clone());
        }
        if let Some(error) = &result.error {
            data.insert("error".into(), JsonValue::String(error.clone()));
        }
        if let Some(category) = &result.error_category {
            data.insert("error_category".into(), JsonValue::String(category.clone()));
        }
        self.broadcast(kind, data, None)
    }

    /// One heartbeat pass: drop stale or closed connections, ping quiet ones.
    pub fn heartbeat_tick(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let ping_after = self
            .config
            .heartbeat_interval
            .mul_f64(defaults::HEARTBEAT_IDLE_FRACTION);

        for connection in self.snapshot() {
            let idle = connection.idle_for();
            if !connection.is_active() || idle >= self.config.stale_timeout {
                if self.remove_if_same(&connection) {
                    report.removed += 1;
                    info!(client_id = %connection.client_id, idle_secs = idle.as_secs(), "Removed stale connection");
                }
                continue;
            }
            if idle >= ping_after && connection.send_event(StreamEvent::ping(connection.client_id.clone())) {
                report.pinged += 1;
            }
        }
        report
    }

    /// Remove `connection` unless its id has since been taken by a newer one.
    fn remove_if_same(&self, connection: &Arc<Connection>) -> bool {
        let Ok(mut connections) = self.connections.write() else {
            return false;
        };
        let same = connections
            .get(&connection.client_id)
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if same {
            connections.remove(&connection.client_id);
        }
        connection.close();
        same
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        let mut connections: Vec<ConnectionInfo> = self
            .snapshot()
            .iter()
            .map(|c| {
                let mut subscriptions: Vec<EventKind> = c.subscriptions.iter().copied().collect();
                subscriptions.sort_by_key(|k| k.as_str());
                ConnectionInfo {
                    client_id: c.client_id.clone(),
                    subscriptions,
                    queued_events: c.queued_events(),
                    events_sent: c.events_sent(),
                    events_dropped: c.events_dropped(),
                    age_secs: c.age().as_secs_f64(),
                    idle_secs: c.idle_for().as_secs_f64(),
                }
            })
            .collect();
        connections.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        let mut subscriptions: HashMap<EventKind, usize> = HashMap::new();
        for info in &connections {
            for kind in &info.subscriptions {
                *subscriptions.entry(*kind).or_default() += 1;
            }
        }
        let count = connections.len().max(1) as f64;
        let ages = connections.iter().map(|c| c.age_secs);
        let idles = connections.iter().map(|c| c.idle_secs);

        ConnectionStats {
            active_connections: connections.len(),
            max_connections: self.config.max_connections,
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_broadcasts: self.total_broadcasts.load(Ordering::Relaxed),
            total_events_sent: self.total_sent.load(Ordering::Relaxed),
            total_events_failed: self.total_failed.load(Ordering::Relaxed),
            average_age_secs: ages.clone().sum::<f64>() / count,
            max_age_secs: ages.fold(0.0, f64::max),
            average_idle_secs: idles.clone().sum::<f64>() / count,
            max_idle_secs: idles.fold(0.0, f64::max),
            subscriptions,
            connections,
        }
    }

    /// Close and remove every connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Connection>> = match self.connections.write() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => return 0,
        };
        for connection in &drained {
            connection.close();
        }
        drained.len()
    }
}
