use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::{Batch, Record, StreamType};

pub const BATCH_SIZE_THRESHOLD: usize = 100;
pub const BATCH_TIME_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Pending {
    records: Vec<Record>,
    last_flush: Instant,
}

/// Pending records keyed by (listen port, stream). A flush swaps the list out under the lock and
/// hands it back to the caller, so delivery never runs while the lock is held.
#[derive(Debug)]
pub struct TelemetryBuffer {
    size_threshold: usize,
    time_threshold: Duration,
    pending: Mutex<HashMap<(u16, StreamType), Pending>>,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new(BATCH_SIZE_THRESHOLD, BATCH_TIME_THRESHOLD)
    }
}

impl TelemetryBuffer {
    pub fn new(size_threshold: usize, time_threshold: Duration) -> Self {
        Self {
            size_threshold: size_threshold.max(1),
            time_threshold,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append a record and return the batch to deliver if this append crossed a flush threshold.
    pub fn append(&self, port: u16, record: Record) -> Option<Batch> {
        let stream = record.stream();
        let now = Instant::now();
        let mut pending = self.lock();
        let slot = pending.entry((port, stream)).or_insert_with(|| Pending {
            records: Vec::with_capacity(self.size_threshold),
            last_flush: now,
        });
        slot.records.push(record);

        let full = slot.records.len() >= self.size_threshold;
        let aged = now.duration_since(slot.last_flush) >= self.time_threshold;
        (full || aged).then(|| self.swap_out(port, stream, slot, now))
    }

    /// Swap out every non-empty buffer whose last flush is at least the time threshold ago.
    pub fn take_stale(&self) -> Vec<Batch> {
        let now = Instant::now();
        let mut pending = self.lock();
        pending
            .iter_mut()
            .filter(|(_, slot)| {
                !slot.records.is_empty()
                    && now.duration_since(slot.last_flush) >= self.time_threshold
            })
            .map(|(&(port, stream), slot)| self.swap_out(port, stream, slot, now))
            .collect()
    }

    /// Swap out every non-empty buffer regardless of age.
    pub fn drain(&self) -> Vec<Batch> {
        let now = Instant::now();
        let mut pending = self.lock();
        pending
            .iter_mut()
            .filter(|(_, slot)| !slot.records.is_empty())
            .map(|(&(port, stream), slot)| self.swap_out(port, stream, slot, now))
            .collect()
    }

    pub fn pending_records(&self) -> usize {
        self.lock().values().map(|slot| slot.records.len()).sum()
    }

    fn swap_out(&self, port: u16, stream: StreamType, slot: &mut Pending, now: Instant) -> Batch {
        slot.last_flush = now;
        let records = std::mem::replace(
            &mut slot.records,
            Vec::with_capacity(self.size_threshold),
        );
        Batch {
            port,
            stream,
            records,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u16, StreamType), Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{L2nRecord, WebRecord};
    use chrono::Utc;
    use tokio::time::advance;

    fn web(worker_id: u32) -> Record {
        Record::Web(WebRecord {
            timestamp: Utc::now(),
            client_ip: "198.51.100.7".parse().unwrap(),
            client_port: 40_000,
            duration_ms: 1.0,
            worker_id,
        })
    }

    fn l2n(worker_id: u32) -> Record {
        Record::L2n(L2nRecord {
            timestamp: Utc::now(),
            backend_ip: "10.0.0.5".parse().unwrap(),
            backend_port: 443,
            latency_ms: 0.5,
            duration_ms: 1.0,
            worker_id,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn size_threshold_flushes_exactly_once() {
        let buffer = TelemetryBuffer::default();
        let mut flushes = Vec::new();
        for i in 0..BATCH_SIZE_THRESHOLD as u32 {
            if let Some(batch) = buffer.append(9443, web(i)) {
                flushes.push(batch);
            }
        }

        assert_eq!(flushes.len(), 1);
        let batch = &flushes[0];
        assert_eq!((batch.port, batch.stream), (9443, StreamType::Web));
        assert_eq!(batch.records.len(), BATCH_SIZE_THRESHOLD);
        assert!(matches!(&batch.records[0], Record::Web(web) if web.worker_id == 0));
        assert!(matches!(&batch.records[99], Record::Web(web) if web.worker_id == 99));
        assert_eq!(buffer.pending_records(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_threshold_flushes_on_next_append() {
        let buffer = TelemetryBuffer::default();
        for i in 0..10 {
            assert!(buffer.append(80, web(i)).is_none());
        }
        advance(BATCH_TIME_THRESHOLD).await;

        let batch = buffer.append(80, web(10)).expect("aged buffer should flush");
        assert_eq!(batch.records.len(), 11);
        assert!(buffer.append(80, web(11)).is_none());
        assert_eq!(buffer.pending_records(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_scan_flushes_idle_buffer_once() {
        let buffer = TelemetryBuffer::default();
        for i in 0..10 {
            buffer.append(80, web(i));
        }
        advance(BATCH_TIME_THRESHOLD - Duration::from_millis(1)).await;
        assert!(buffer.take_stale().is_empty());

        advance(Duration::from_millis(1)).await;
        let batches = buffer.take_stale();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 10);
        assert_eq!(buffer.pending_records(), 0);

        advance(BATCH_TIME_THRESHOLD).await;
        assert!(buffer.take_stale().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streams_and_ports_are_buffered_separately() {
        let buffer = TelemetryBuffer::new(2, BATCH_TIME_THRESHOLD);
        assert!(buffer.append(80, web(1)).is_none());
        assert!(buffer.append(80, l2n(1)).is_none());
        assert!(buffer.append(81, web(2)).is_none());

        let batch = buffer.append(80, l2n(2)).expect("second l2n record fills the batch");
        assert_eq!((batch.port, batch.stream), (80, StreamType::L2n));
        assert_eq!(buffer.pending_records(), 2);

        let mut drained: Vec<_> = buffer
            .drain()
            .into_iter()
            .map(|b| (b.port, b.stream, b.records.len()))
            .collect();
        drained.sort();
        assert_eq!(drained, [(80, StreamType::Web, 1), (81, StreamType::Web, 1)]);
        assert!(buffer.drain().is_empty());
    }
}
