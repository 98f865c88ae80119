//! Metrics sink
//!
//! A single worker owns the per-origin write/drop counters; every update and
//! every read travels over its channel, so the map needs no lock. Readers get
//! a consistent snapshot by sending a request message and waiting for the
//! reply. A heartbeat tick evicts the least-recently-updated origins down to
//! the configured cap even when no traffic arrives.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::data::error::DataError;
use crate::utils::circbuf::CircBufU32;

/// Queue depth for sink commands.
const SINK_CHANNEL_CAPACITY: usize = 128;

/// Slots in the ingestor-lifetime latency ring.
const LATENCY_RING_SLOTS: usize = 64;

/// Write/drop counters for one origin address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpanMetrics {
    #[serde(rename = "Written")]
    pub written: u64,
    #[serde(rename = "ServerDropped")]
    pub server_dropped: u64,
}

impl SpanMetrics {
    pub fn written(count: u64) -> Self {
        SpanMetrics {
            written: count,
            server_dropped: 0,
        }
    }

    pub fn dropped(count: u64) -> Self {
        SpanMetrics {
            written: 0,
            server_dropped: count,
        }
    }

    fn add(&mut self, other: &SpanMetrics) {
        self.written += other.written;
        self.server_dropped += other.server_dropped;
    }
}

/// Per-origin delta map sent by writers and closing ingestors.
pub type SpanMetricsMap = HashMap<String, SpanMetrics>;

/// Consistent snapshot of the sink's state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerTotals {
    #[serde(rename = "IngestedSpans")]
    pub ingested_spans: u64,
    #[serde(rename = "ByOrigin")]
    pub by_origin: HashMap<String, SpanMetrics>,
    #[serde(skip)]
    pub ingest_latency_avg_ms: u32,
    #[serde(skip)]
    pub ingest_latency_max_ms: u32,
}

enum SinkCommand {
    Update(SpanMetricsMap),
    IngestTime(u32),
    AccessTotals(oneshot::Sender<ServerTotals>),
    Shutdown,
}

pub struct MetricsSinkConfig {
    pub max_addr_entries: usize,
    pub heartbeat_period: Duration,
}

/// Handle to the metrics worker. Cheap to clone via Arc.
pub struct MetricsSink {
    tx: mpsc::Sender<SinkCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsSink {
    pub fn new(config: MetricsSinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
        let task = tokio::spawn(run_sink(rx, config));
        MetricsSink {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Fold a delta map into the totals.
    pub async fn update(&self, deltas: SpanMetricsMap) {
        if deltas.is_empty() {
            return;
        }
        let _ = self.tx.send(SinkCommand::Update(deltas)).await;
    }

    /// Record one ingestor lifetime in milliseconds.
    pub async fn record_ingest_time(&self, elapsed_ms: u32) {
        let _ = self.tx.send(SinkCommand::IngestTime(elapsed_ms)).await;
    }

    /// Read a consistent snapshot of the totals.
    pub async fn access_totals(&self) -> Result<ServerTotals, DataError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::AccessTotals(reply_tx))
            .await
            .map_err(|_| DataError::ShutDown)?;
        reply_rx.await.map_err(|_| DataError::ShutDown)
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = self.tx.send(SinkCommand::Shutdown).await;
            let _ = task.await;
        }
    }
}

struct OriginEntry {
    metrics: SpanMetrics,
    last_updated: u64,
}

async fn run_sink(mut rx: mpsc::Receiver<SinkCommand>, config: MetricsSinkConfig) {
    let mut origins: HashMap<String, OriginEntry> = HashMap::new();
    let mut ingested: u64 = 0;
    let mut seq: u64 = 0;
    let mut latency = CircBufU32::new(LATENCY_RING_SLOTS);

    let mut heartbeat =
        tokio::time::interval(config.heartbeat_period.max(Duration::from_millis(1)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::debug!(
        max_addr_entries = config.max_addr_entries,
        heartbeat_ms = config.heartbeat_period.as_millis() as u64,
        "MetricsSink started"
    );

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(SinkCommand::Update(deltas)) => {
                        for (origin, delta) in deltas {
                            ingested += delta.written;
                            seq += 1;
                            let entry = origins.entry(origin).or_insert(OriginEntry {
                                metrics: SpanMetrics::default(),
                                last_updated: seq,
                            });
                            entry.metrics.add(&delta);
                            entry.last_updated = seq;
                        }
                        evict(&mut origins, config.max_addr_entries);
                    }
                    Some(SinkCommand::IngestTime(elapsed_ms)) => {
                        latency.append(elapsed_ms);
                    }
                    Some(SinkCommand::AccessTotals(reply)) => {
                        let totals = ServerTotals {
                            ingested_spans: ingested,
                            by_origin: origins
                                .iter()
                                .map(|(origin, entry)| (origin.clone(), entry.metrics))
                                .collect(),
                            ingest_latency_avg_ms: latency.average(),
                            ingest_latency_max_ms: latency.max(),
                        };
                        let _ = reply.send(totals);
                    }
                    Some(SinkCommand::Shutdown) | None => break,
                }
            }
            _ = heartbeat.tick() => {
                evict(&mut origins, config.max_addr_entries);
            }
        }
    }

    tracing::debug!(ingested, "MetricsSink shutdown complete");
}

/// Drop the least-recently-updated origins until the cap holds.
fn evict(origins: &mut HashMap<String, OriginEntry>, max_entries: usize) {
    while origins.len() > max_entries {
        let oldest = origins
            .iter()
            .min_by_key(|(_, entry)| entry.last_updated)
            .map(|(origin, _)| origin.clone());
        match oldest {
            Some(origin) => {
                tracing::debug!(origin = %origin, "Evicting idle origin from metrics");
                origins.remove(&origin);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(max_addr_entries: usize, heartbeat_ms: u64) -> MetricsSink {
        MetricsSink::new(MetricsSinkConfig {
            max_addr_entries,
            heartbeat_period: Duration::from_millis(heartbeat_ms),
        })
    }

    async fn wait_for<F: Fn(&ServerTotals) -> bool>(msink: &MetricsSink, check: F) -> ServerTotals {
        loop {
            let totals = msink.access_totals().await.unwrap();
            if check(&totals) {
                return totals;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_totals_start_empty() {
        let msink = sink(16, 30_000);
        let totals = msink.access_totals().await.unwrap();
        assert_eq!(totals.ingested_spans, 0);
        assert!(totals.by_origin.is_empty());
    }

    #[tokio::test]
    async fn test_updates_fold_into_totals() {
        let msink = sink(16, 30_000);
        msink
            .update(SpanMetricsMap::from([(
                "192.168.0.100".to_string(),
                SpanMetrics {
                    written: 20,
                    server_dropped: 10,
                },
            )]))
            .await;
        let totals = wait_for(&msink, |t| !t.by_origin.is_empty()).await;
        assert_eq!(
            totals.by_origin["192.168.0.100"],
            SpanMetrics {
                written: 20,
                server_dropped: 10,
            }
        );

        msink
            .update(SpanMetricsMap::from([(
                "192.168.0.100".to_string(),
                SpanMetrics {
                    written: 200,
                    server_dropped: 100,
                },
            )]))
            .await;
        msink
            .update(SpanMetricsMap::from([(
                "192.168.0.100".to_string(),
                SpanMetrics {
                    written: 1000,
                    server_dropped: 1000,
                },
            )]))
            .await;
        let totals = wait_for(&msink, |t| {
            t.by_origin
                .get("192.168.0.100")
                .is_some_and(|m| m.written == 1220)
        })
        .await;
        assert_eq!(totals.by_origin["192.168.0.100"].server_dropped, 1110);
        assert_eq!(totals.ingested_spans, 1220);
    }

    #[tokio::test]
    async fn test_totals_are_monotonic() {
        let msink = sink(16, 30_000);
        let mut expected = 0;
        for round in 1..=5u64 {
            expected += round;
            msink
                .update(SpanMetricsMap::from([(
                    "10.0.0.1".to_string(),
                    SpanMetrics::written(round),
                )]))
                .await;
            let totals = wait_for(&msink, |t| t.ingested_spans >= expected).await;
            assert_eq!(totals.ingested_spans, expected);
            assert_eq!(totals.by_origin["10.0.0.1"].written, expected);
        }
    }

    #[tokio::test]
    async fn test_eviction_respects_cap() {
        let msink = sink(2, 1);
        msink
            .update(SpanMetricsMap::from([
                ("192.168.0.100".to_string(), SpanMetrics::written(20)),
                ("192.168.0.101".to_string(), SpanMetrics::written(20)),
                ("192.168.0.102".to_string(), SpanMetrics::written(20)),
            ]))
            .await;
        let totals = wait_for(&msink, |t| t.by_origin.len() == 2).await;
        assert_eq!(totals.by_origin.len(), 2);
        // The cumulative counter is unaffected by eviction.
        assert_eq!(totals.ingested_spans, 60);
    }

    #[tokio::test]
    async fn test_ingest_latency_ring() {
        let msink = sink(16, 30_000);
        msink.record_ingest_time(4).await;
        msink.record_ingest_time(8).await;
        let totals = wait_for(&msink, |t| t.ingest_latency_max_ms == 8).await;
        assert_eq!(totals.ingest_latency_avg_ms, 6);
    }
}
