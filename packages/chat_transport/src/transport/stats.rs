//! Running comparison statistics for shadow probes.
//!
//! Stats are persisted as JSON under a per-class key after every update so
//! they survive restarts. When the failure counts cross a threshold (and the
//! last report is old enough) the notifier is told once and the counters
//! start over.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::request::AuthClass;
use crate::transport::service::ServiceResponse;

/// Minimum comparisons before a report can be made.
const MIN_REQUESTS_COMPARED: u64 = 1000;
/// Bad statuses plus failures that trigger a report.
const FAILURE_THRESHOLD: u64 = 20;
/// Probes while the service was inactive that trigger a report.
const INACTIVE_THRESHOLD: u64 = 100;
const NOTIFY_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonStats {
    pub requests_compared: u64,
    pub bad_status_count: u64,
    pub failure_count: u64,
    pub requests_during_inactive: u64,
    pub last_notify_time: Option<DateTime<Utc>>,
}

/// How a single shadow probe turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowOutcome {
    Status(u16),
    /// The service was not connected; the probe says nothing about it.
    Inactive,
    Failed(String),
}

impl ShadowOutcome {
    pub fn from_result(result: &Result<ServiceResponse, ServiceError>) -> Self {
        match result {
            Ok(response) => ShadowOutcome::Status(response.status),
            Err(ServiceError::ServiceInactive) => ShadowOutcome::Inactive,
            Err(e) => ShadowOutcome::Failed(e.to_string()),
        }
    }
}

impl ComparisonStats {
    pub fn record(&mut self, outcome: &ShadowOutcome) {
        match outcome {
            ShadowOutcome::Status(status) => {
                self.requests_compared += 1;
                if !(200..300).contains(status) {
                    self.bad_status_count += 1;
                }
            }
            ShadowOutcome::Inactive => self.requests_during_inactive += 1,
            ShadowOutcome::Failed(_) => {
                self.requests_compared += 1;
                self.failure_count += 1;
            }
        }
    }

    pub fn should_notify(&self, now: DateTime<Utc>) -> bool {
        if self.requests_compared < MIN_REQUESTS_COMPARED {
            return false;
        }
        if let Some(last) = self.last_notify_time
            && now - last < TimeDelta::hours(NOTIFY_COOLDOWN_HOURS)
        {
            return false;
        }
        self.bad_status_count + self.failure_count > FAILURE_THRESHOLD
            || self.requests_during_inactive > INACTIVE_THRESHOLD
    }

    /// Zero the counters and remember when we last reported.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        *self = ComparisonStats {
            last_notify_time: Some(now),
            ..Default::default()
        };
    }
}

/// Durable string storage for the stats.
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }
}

/// Told when the shadow transport looks unhealthy.
pub trait ShadowingNotifier: Send + Sync + 'static {
    fn notify(&self, stats: &ComparisonStats);
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ShadowingNotifier for LogNotifier {
    fn notify(&self, stats: &ComparisonStats) {
        warn!(
            compared = stats.requests_compared,
            bad_status = stats.bad_status_count,
            failures = stats.failure_count,
            inactive = stats.requests_during_inactive,
            "shadow transport is unhealthy"
        );
    }
}

pub fn stats_key(class: AuthClass) -> String {
    format!("chat_transport.shadowing.{class}")
}

enum StatsCommand {
    Record(ShadowOutcome),
    Snapshot(oneshot::Sender<ComparisonStats>),
}

/// Handle to the task that owns one class's stats.
#[derive(Clone)]
pub(crate) struct StatsRecorder {
    tx: mpsc::UnboundedSender<StatsCommand>,
}

impl StatsRecorder {
    pub(crate) fn spawn(
        key: String,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn ShadowingNotifier>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stats = load(&key, store.as_ref());
            while let Some(command) = rx.recv().await {
                match command {
                    StatsCommand::Record(outcome) => {
                        stats.record(&outcome);
                        let now = Utc::now();
                        if stats.should_notify(now) {
                            notifier.notify(&stats);
                            stats.reset(now);
                        }
                        match serde_json::to_string(&stats) {
                            Ok(json) => store.set(&key, json),
                            Err(e) => warn!(%key, "failed to serialize shadowing stats: {e}"),
                        }
                    }
                    StatsCommand::Snapshot(reply) => {
                        let _ = reply.send(stats.clone());
                    }
                }
            }
            debug!(%key, "stats recorder stopped");
        });
        Self { tx }
    }

    pub(crate) fn record(&self, outcome: ShadowOutcome) {
        let _ = self.tx.send(StatsCommand::Record(outcome));
    }

    pub(crate) async fn snapshot(&self) -> Option<ComparisonStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StatsCommand::Snapshot(reply)).ok()?;
        rx.await.ok()
    }
}

fn load(key: &str, store: &dyn KeyValueStore) -> ComparisonStats {
    let Some(raw) = store.get(key) else {
        return ComparisonStats::default();
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(%key, "discarding unreadable shadowing stats: {e}");
        ComparisonStats::default()
    })
}
