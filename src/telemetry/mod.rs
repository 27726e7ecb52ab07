//! Connection telemetry: per-connection records are batched per (port, stream) and pushed to the
//! control plane off the forwarding path.

pub mod buffer;
pub mod client;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

pub use buffer::TelemetryBuffer;
pub use client::{TelemetryClient, TelemetryError};

use crate::supervisor::ShutdownRx;

/// Concurrent deliveries allowed against the control plane.
pub const MAX_INFLIGHT_PUSHES: usize = 64;
const STALE_SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    /// Client-facing leg.
    Web,
    /// Backend leg.
    L2n,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Web => "web",
            StreamType::L2n => "l2n",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebRecord {
    pub timestamp: DateTime<Utc>,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub duration_ms: f64,
    pub worker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct L2nRecord {
    pub timestamp: DateTime<Utc>,
    pub backend_ip: IpAddr,
    pub backend_port: u16,
    pub latency_ms: f64,
    pub duration_ms: f64,
    pub worker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Web(WebRecord),
    L2n(L2nRecord),
}

impl Record {
    pub fn stream(&self) -> StreamType {
        match self {
            Record::Web(_) => StreamType::Web,
            Record::L2n(_) => StreamType::L2n,
        }
    }
}

/// Records swapped out of one (port, stream) buffer, ready to be pushed.
#[derive(Debug)]
pub struct Batch {
    pub port: u16,
    pub stream: StreamType,
    pub records: Vec<Record>,
}

impl Batch {
    /// Path of the control plane endpoint for this batch, relative to its base URL.
    pub fn endpoint(&self) -> String {
        format!("api/v1/{}/{}", self.stream, self.port)
    }
}

/// Handle shared by every worker: appends go to the buffer, flushed batches are delivered on
/// their own tasks, bounded by [`MAX_INFLIGHT_PUSHES`]. Appending never waits on delivery; a
/// batch that finds every slot busy is shed and counted.
#[derive(Clone)]
pub struct Telemetry {
    buffer: Arc<TelemetryBuffer>,
    client: Arc<TelemetryClient>,
    inflight: Arc<Semaphore>,
    max_inflight: usize,
}

impl Telemetry {
    pub fn new(buffer: TelemetryBuffer, client: TelemetryClient) -> Self {
        Self::with_max_inflight(buffer, client, MAX_INFLIGHT_PUSHES)
    }

    pub fn with_max_inflight(
        buffer: TelemetryBuffer,
        client: TelemetryClient,
        max_inflight: usize,
    ) -> Self {
        let max_inflight = max_inflight.max(1);
        Self {
            buffer: Arc::new(buffer),
            client: Arc::new(client),
            inflight: Arc::new(Semaphore::new(max_inflight)),
            max_inflight,
        }
    }

    pub fn record(&self, port: u16, record: Record) {
        if let Some(batch) = self.buffer.append(port, record) {
            self.dispatch(batch);
        }
    }

    /// Push every buffer that has waited out the batch time threshold.
    pub fn flush_stale(&self) {
        for batch in self.buffer.take_stale() {
            self.dispatch(batch);
        }
    }

    /// Push whatever is left and wait for all in-flight deliveries. Unlike the hot path this
    /// waits for a free slot rather than shedding.
    pub async fn drain(&self) {
        let batches = self.buffer.drain();
        if !batches.is_empty() {
            info!(batches = batches.len(), "flushing pending telemetry");
        }
        for batch in batches {
            let Ok(permit) = Arc::clone(&self.inflight).acquire_owned().await else {
                return;
            };
            self.spawn_delivery(batch, permit);
        }
        let _idle = self.inflight.acquire_many(self.max_inflight as u32).await;
    }

    fn dispatch(&self, batch: Batch) {
        match Arc::clone(&self.inflight).try_acquire_owned() {
            Ok(permit) => self.spawn_delivery(batch, permit),
            Err(_) => {
                warn!(
                    endpoint = %batch.endpoint(),
                    records = batch.records.len(),
                    "telemetry deliveries saturated; shedding batch"
                );
                self.client.stats().record_shed(batch.records.len());
            }
        }
    }

    fn spawn_delivery(&self, batch: Batch, permit: OwnedSemaphorePermit) {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            client.deliver(batch).await;
            drop(permit);
        });
    }
}

/// Periodically flushes aged buffers so an idle port does not hold records until its next
/// connection, and drains everything once shutdown is signalled.
pub fn spawn_flusher(telemetry: Telemetry, mut shutdown: ShutdownRx) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut ticker = interval(STALE_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        debug!("shutdown received; draining telemetry");
                        break;
                    }
                }
                _ = ticker.tick() => telemetry.flush_stale(),
            }
        }
        telemetry.drain().await;
        Ok(())
    })
}
