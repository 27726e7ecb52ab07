use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-wide counters shared by every worker and read by the monitoring API.
#[derive(Debug, Default)]
pub struct GlobalStats {
    backend_pushes: AtomicU64,
    backend_push_failures: AtomicU64,
    circuit_breaker_drops: AtomicU64,
    telemetry_batches_shed: AtomicU64,
    telemetry_records_dropped: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    backend_connect_failures: AtomicU64,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub backend_pushes: u64,
    pub backend_push_failures: u64,
    pub circuit_breaker_drops: u64,
    pub telemetry_batches_shed: u64,
    pub telemetry_records_dropped: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub backend_connect_failures: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
}

impl GlobalStats {
    pub fn record_push(&self) {
        self.backend_pushes.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch of `records` was given up on after exhausting its attempts.
    pub fn record_push_failure(&self, records: usize) {
        self.backend_push_failures.fetch_add(1, Ordering::Relaxed);
        self.telemetry_records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// A batch of `records` was never attempted because the breaker was open.
    pub fn record_breaker_drop(&self, records: usize) {
        self.circuit_breaker_drops.fetch_add(1, Ordering::Relaxed);
        self.telemetry_records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    /// A batch of `records` was discarded because every delivery slot was busy.
    pub fn record_shed(&self, records: usize) {
        self.telemetry_batches_shed.fetch_add(1, Ordering::Relaxed);
        self.telemetry_records_dropped
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_backend_connect_failure(&self) {
        self.backend_connect_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.total_bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.total_bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Count an accepted connection; the returned guard keeps it in `active_connections`.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            backend_pushes: self.backend_pushes.load(Ordering::Relaxed),
            backend_push_failures: self.backend_push_failures.load(Ordering::Relaxed),
            circuit_breaker_drops: self.circuit_breaker_drops.load(Ordering::Relaxed),
            telemetry_batches_shed: self.telemetry_batches_shed.load(Ordering::Relaxed),
            telemetry_records_dropped: self.telemetry_records_dropped.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            backend_connect_failures: self.backend_connect_failures.load(Ordering::Relaxed),
            total_bytes_in: self.total_bytes_in.load(Ordering::Relaxed),
            total_bytes_out: self.total_bytes_out.load(Ordering::Relaxed),
        }
    }
}

pub struct ConnectionGuard {
    stats: Arc<GlobalStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_tracks_active_count() {
        let stats = Arc::new(GlobalStats::default());
        let first = stats.open_connection();
        let second = stats.open_connection();
        assert_eq!(stats.snapshot().active_connections, 2);
        drop(first);
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.total_connections, 2);
    }

    #[test]
    fn drops_account_for_records() {
        let stats = GlobalStats::default();
        stats.record_breaker_drop(7);
        stats.record_push_failure(3);
        stats.record_shed(5);
        stats.record_bytes(10, 20);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.circuit_breaker_drops, 1);
        assert_eq!(snapshot.backend_push_failures, 1);
        assert_eq!(snapshot.telemetry_batches_shed, 1);
        assert_eq!(snapshot.telemetry_records_dropped, 15);
        assert_eq!((snapshot.total_bytes_in, snapshot.total_bytes_out), (10, 20));
    }
}
