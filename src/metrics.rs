//! Transport metrics collection.
//!
//! Counters are aggregates safe for monitoring; no per-user data is stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters shared by the underlays of one process.
pub struct TransportMetrics {
    /// Creation time, for rate derivations
    start_time: Instant,
    /// Datagrams from a source the client never contacted
    unsolicited_udp: AtomicU64,
    /// Datagrams too short or failing decryption
    malformed_udp: AtomicU64,
    /// Datagrams rejected as replays
    replay_new_session: AtomicU64,
    /// Data/ack segments dropped because a session queue was full
    recv_queue_drop: AtomicU64,
    /// Valid segments delivered by the event loop
    segments_received: AtomicU64,
    /// Segments written to the socket
    segments_sent: AtomicU64,
}

impl TransportMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            unsolicited_udp: AtomicU64::new(0),
            malformed_udp: AtomicU64::new(0),
            replay_new_session: AtomicU64::new(0),
            recv_queue_drop: AtomicU64::new(0),
            segments_received: AtomicU64::new(0),
            segments_sent: AtomicU64::new(0),
        }
    }

    /// Count a datagram from an unexpected source.
    pub fn add_unsolicited(&self) {
        self.unsolicited_udp.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a malformed or unauthenticated datagram.
    pub fn add_malformed(&self) {
        self.malformed_udp.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a replayed datagram.
    pub fn add_replay(&self) {
        self.replay_new_session.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a segment dropped on queue overflow.
    pub fn add_recv_queue_drop(&self) {
        self.recv_queue_drop.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a valid segment handed to the dispatcher.
    pub fn add_segment_received(&self) {
        self.segments_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a segment written to the wire.
    pub fn add_segment_sent(&self) {
        self.segments_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Get unsolicited datagram count.
    pub fn unsolicited_udp(&self) -> u64 {
        self.unsolicited_udp.load(Ordering::Relaxed)
    }

    /// Get malformed datagram count.
    pub fn malformed_udp(&self) -> u64 {
        self.malformed_udp.load(Ordering::Relaxed)
    }

    /// Get replay rejection count.
    pub fn replay_new_session(&self) -> u64 {
        self.replay_new_session.load(Ordering::Relaxed)
    }

    /// Get queue-overflow drop count.
    pub fn recv_queue_drop(&self) -> u64 {
        self.recv_queue_drop.load(Ordering::Relaxed)
    }

    /// Get received segment count.
    pub fn segments_received(&self) -> u64 {
        self.segments_received.load(Ordering::Relaxed)
    }

    /// Get sent segment count.
    pub fn segments_sent(&self) -> u64 {
        self.segments_sent.load(Ordering::Relaxed)
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            unsolicited_udp: self.unsolicited_udp(),
            malformed_udp: self.malformed_udp(),
            replay_new_session: self.replay_new_session(),
            recv_queue_drop: self.recv_queue_drop(),
            segments_received: self.segments_received(),
            segments_sent: self.segments_sent(),
        }
    }

    /// Format counters as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"Shroud Transport Metrics
========================
Uptime: {} seconds

Segments:
  Received: {}
  Sent:     {}

Rejected:
  Unsolicited:  {}
  Malformed:    {}
  Replayed:     {}
  Queue drops:  {}
"#,
            snapshot.uptime_secs,
            snapshot.segments_received,
            snapshot.segments_sent,
            snapshot.unsolicited_udp,
            snapshot.malformed_udp,
            snapshot.replay_new_session,
            snapshot.recv_queue_drop,
        )
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since the collector was created
    pub uptime_secs: u64,
    /// Datagrams from a source the client never contacted
    pub unsolicited_udp: u64,
    /// Datagrams too short or failing decryption
    pub malformed_udp: u64,
    /// Datagrams rejected as replays
    pub replay_new_session: u64,
    /// Segments dropped on session-queue overflow
    pub recv_queue_drop: u64,
    /// Valid segments delivered by the event loop
    pub segments_received: u64,
    /// Segments written to the socket
    pub segments_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = TransportMetrics::new();
        assert_eq!(metrics.unsolicited_udp(), 0);
        assert_eq!(metrics.segments_received(), 0);
    }

    #[test]
    fn test_counting() {
        let metrics = TransportMetrics::new();

        metrics.add_unsolicited();
        metrics.add_malformed();
        metrics.add_malformed();
        metrics.add_replay();
        metrics.add_segment_received();

        assert_eq!(metrics.unsolicited_udp(), 1);
        assert_eq!(metrics.malformed_udp(), 2);
        assert_eq!(metrics.replay_new_session(), 1);
        assert_eq!(metrics.segments_received(), 1);
        assert_eq!(metrics.segments_sent(), 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = TransportMetrics::new();
        metrics.add_segment_sent();
        metrics.add_recv_queue_drop();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.segments_sent, 1);
        assert_eq!(snapshot.recv_queue_drop, 1);
        assert_eq!(snapshot.malformed_udp, 0);
    }

    #[test]
    fn test_format_report() {
        let metrics = TransportMetrics::new();
        metrics.add_replay();

        let report = metrics.format_report();
        assert!(report.contains("Shroud Transport Metrics"));
        assert!(report.contains("Replayed:     1"));
    }
}
