//! Observability and Metrics
//!
//! Counters for packet traffic, bulk transfers, and router relays.
//!
//! Uses atomic counters for thread-safe metrics collection. A [`Metrics`]
//! instance is shared with `Arc` by every transport and router that should
//! report into it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for transport and router operations
#[derive(Debug)]
pub struct Metrics {
    /// Transports that became ready
    pub transports_opened: AtomicU64,
    /// Transports that closed
    pub transports_closed: AtomicU64,
    /// JSON packets written
    pub packets_sent: AtomicU64,
    /// JSON packets delivered to hooks
    pub packets_received: AtomicU64,
    /// Bytes written to channels
    pub bytes_sent: AtomicU64,
    /// Bytes read from channels
    pub bytes_received: AtomicU64,
    /// Bulk packets written
    pub bulk_sent: AtomicU64,
    /// Bulk packets handed to consumers
    pub bulk_received: AtomicU64,
    /// Requests correlated with a reply
    pub exchanges_completed: AtomicU64,
    /// Requests mirrored onto sibling connections
    pub relays_forwarded: AtomicU64,
    /// Relays that had to wait for a missing exchange
    pub relays_deferred: AtomicU64,
    /// Relays given up on
    pub relays_dropped: AtomicU64,
    /// Framing failures
    pub framing_errors: AtomicU64,
    /// Request/reply synchronization failures
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            transports_opened: AtomicU64::new(0),
            transports_closed: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bulk_sent: AtomicU64::new(0),
            bulk_received: AtomicU64::new(0),
            exchanges_completed: AtomicU64::new(0),
            relays_forwarded: AtomicU64::new(0),
            relays_deferred: AtomicU64::new(0),
            relays_dropped: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn transport_opened(&self) {
        self.transports_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_closed(&self) {
        self.transports_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet written
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a packet delivered
    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record raw bytes read from a channel
    pub fn bytes_read(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bulk_packet_sent(&self, byte_count: u64) {
        self.bulk_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bulk_packet_received(&self) {
        self.bulk_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exchange_completed(&self) {
        self.exchanges_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_forwarded(&self) {
        self.relays_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_deferred(&self) {
        self.relays_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_dropped(&self) {
        self.relays_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a framing error
    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a protocol error
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transports_opened: self.transports_opened.load(Ordering::Relaxed),
            transports_closed: self.transports_closed.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bulk_sent: self.bulk_sent.load(Ordering::Relaxed),
            bulk_received: self.bulk_received.load(Ordering::Relaxed),
            exchanges_completed: self.exchanges_completed.load(Ordering::Relaxed),
            relays_forwarded: self.relays_forwarded.load(Ordering::Relaxed),
            relays_deferred: self.relays_deferred.load(Ordering::Relaxed),
            relays_dropped: self.relays_dropped.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            transports_opened = snapshot.transports_opened,
            transports_closed = snapshot.transports_closed,
            packets_sent = snapshot.packets_sent,
            packets_received = snapshot.packets_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            bulk_sent = snapshot.bulk_sent,
            bulk_received = snapshot.bulk_received,
            exchanges_completed = snapshot.exchanges_completed,
            relays_forwarded = snapshot.relays_forwarded,
            relays_deferred = snapshot.relays_deferred,
            relays_dropped = snapshot.relays_dropped,
            framing_errors = snapshot.framing_errors,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Transport metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transports_opened: u64,
    pub transports_closed: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bulk_sent: u64,
    pub bulk_received: u64,
    pub exchanges_completed: u64,
    pub relays_forwarded: u64,
    pub relays_deferred: u64,
    pub relays_dropped: u64,
    pub framing_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
