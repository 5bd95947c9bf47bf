//! Transport metrics for observability
//!
//! Counters shared by both connections of a manager.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct TransportMetrics {
    // Connection metrics
    /// Physical connect attempts started
    pub connect_attempts: AtomicU64,
    /// Attempts that reached open
    pub connections_opened: AtomicU64,
    /// Connect failures, drops, and heartbeat failures
    pub connection_failures: AtomicU64,

    // Request metrics
    pub requests_sent: AtomicU64,
    pub request_timeouts: AtomicU64,
    pub heartbeats_sent: AtomicU64,

    // Push metrics
    pub pushes_received: AtomicU64,
    pub acks_sent: AtomicU64,

    /// Keepalive probes mirrored onto the shadow transport
    pub shadow_probes: AtomicU64,

    start_time: Option<Instant>,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn push_received(&self) {
        self.pushes_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shadow_probe(&self) {
        self.shadow_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                attempts: self.connect_attempts.load(Ordering::Relaxed),
                opened: self.connections_opened.load(Ordering::Relaxed),
                failures: self.connection_failures.load(Ordering::Relaxed),
            },
            requests: RequestMetrics {
                sent: self.requests_sent.load(Ordering::Relaxed),
                timeouts: self.request_timeouts.load(Ordering::Relaxed),
                heartbeats: self.heartbeats_sent.load(Ordering::Relaxed),
            },
            pushes: PushMetrics {
                received: self.pushes_received.load(Ordering::Relaxed),
                acked: self.acks_sent.load(Ordering::Relaxed),
            },
            shadow_probes: self.shadow_probes.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub requests: RequestMetrics,
    pub pushes: PushMetrics,
    pub shadow_probes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub attempts: u64,
    pub opened: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub sent: u64,
    pub timeouts: u64,
    pub heartbeats: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMetrics {
    pub received: u64,
    pub acked: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = TransportMetrics::new();

        metrics.connect_attempt();
        metrics.connect_attempt();
        metrics.connection_opened();
        metrics.connection_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.attempts, 2);
        assert_eq!(snapshot.connections.opened, 1);
        assert_eq!(snapshot.connections.failures, 1);
    }

    #[test]
    fn test_push_tracking() {
        let metrics = TransportMetrics::new();

        metrics.push_received();
        metrics.push_received();
        metrics.ack_sent();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pushes.received, 2);
        assert_eq!(snapshot.pushes.acked, 1);
    }

    #[test]
    fn test_snapshot_serialization() {
        let metrics = TransportMetrics::new();
        metrics.request_sent();
        metrics.request_timed_out();
        metrics.shadow_probe();

        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"timeouts\":1"));
        assert!(json.contains("\"shadow_probes\":1"));
    }
}
