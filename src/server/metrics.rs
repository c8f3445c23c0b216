//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Error;

/// Server metrics collector.
pub struct ServerMetrics {
    start_time: Instant,
    /// Connections or first datagrams accepted on a hop port
    accepted: AtomicU64,
    /// Flows that passed admission
    admitted: AtomicU64,
    /// Rejected by the origin filter
    rejected_origin: AtomicU64,
    /// Rejected because the origin is throttled
    rejected_throttled: AtomicU64,
    /// Short, truncated or late headers
    rejected_framing: AtomicU64,
    /// Declared step outside skew tolerance
    rejected_skew: AtomicU64,
    /// Token mismatch
    rejected_token: AtomicU64,
    /// Completed rotations
    rotations: AtomicU64,
    /// Hop ports that failed to bind
    bind_failures: AtomicU64,
    /// Bytes relayed from peers to the target
    bytes_upstream: AtomicU64,
    /// Bytes relayed from the target back to peers
    bytes_downstream: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted: AtomicU64::new(0),
            admitted: AtomicU64::new(0),
            rejected_origin: AtomicU64::new(0),
            rejected_throttled: AtomicU64::new(0),
            rejected_framing: AtomicU64::new(0),
            rejected_skew: AtomicU64::new(0),
            rejected_token: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            bind_failures: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }

    /// Increment accepted count.
    pub fn increment_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment admitted count.
    pub fn increment_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejection under the matching reason.
    pub fn record_rejection(&self, err: &Error) {
        let counter = match err {
            Error::OriginRejected(_) => &self.rejected_origin,
            Error::Throttled(_) => &self.rejected_throttled,
            Error::StepSkew { .. } => &self.rejected_skew,
            Error::Authentication => &self.rejected_token,
            _ => &self.rejected_framing,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rotation count.
    pub fn increment_rotations(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment bind failure count.
    pub fn increment_bind_failures(&self) {
        self.bind_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add relayed byte counts.
    pub fn add_relayed(&self, upstream: u64, downstream: u64) {
        self.bytes_upstream.fetch_add(upstream, Ordering::Relaxed);
        self.bytes_downstream.fetch_add(downstream, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            accepted: self.accepted.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_origin: self.rejected_origin.load(Ordering::Relaxed),
            rejected_throttled: self.rejected_throttled.load(Ordering::Relaxed),
            rejected_framing: self.rejected_framing.load(Ordering::Relaxed),
            rejected_skew: self.rejected_skew.load(Ordering::Relaxed),
            rejected_token: self.rejected_token.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            bind_failures: self.bind_failures.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub accepted: u64,
    pub admitted: u64,
    pub rejected_origin: u64,
    pub rejected_throttled: u64,
    pub rejected_framing: u64,
    pub rejected_skew: u64,
    pub rejected_token: u64,
    pub rotations: u64,
    pub bind_failures: u64,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

impl MetricsSnapshot {
    /// Total rejected flows across all reasons.
    pub fn rejected(&self) -> u64 {
        self.rejected_origin
            + self.rejected_throttled
            + self.rejected_framing
            + self.rejected_skew
            + self.rejected_token
    }
}
