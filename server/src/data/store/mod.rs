//! Sharded span datastore
//!
//! Spans are partitioned across a fixed set of shards by a stable hash of the
//! span id. Each shard is an independent embedded store with a single writer
//! worker; readers run against the same handles. Queries fan out to every
//! shard and merge; point lookups go straight to the owning shard.

pub mod index;
pub mod loader;
pub mod query;
pub mod shard;
pub mod writer;


use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use xxhash_rust::xxh3::xxh3_64;

use crate::data::error::DataError;
use crate::data::store::loader::ShardLoader;
use crate::data::store::query::{Query, ScanPlan, ShardScanResult};
use crate::data::store::shard::ShardStore;
use crate::data::store::writer::{ShardWriter, ShardWriterConfig, WriteCommand};
use crate::data::types::{Span, SpanId, decode};
use crate::domain::metrics::MetricsSink;
use crate::utils::circbuf::CircBufU32;

/// Slots in each shard's commit-latency ring.
const COMMIT_LATENCY_SLOTS: usize = 64;

#[derive(Debug, Clone)]
pub struct DataStoreConfig {
    /// Shard directories, one store per directory.
    pub directories: Vec<PathBuf>,
    /// Wipe every directory before initializing.
    pub clear: bool,
    pub writer: ShardWriterConfig,
    /// Period of the latency-reporting heartbeat.
    pub heartbeat_period: Duration,
}

/// The shard a span id lives on. Stable across restarts.
pub fn shard_for_id(id: &SpanId, total_shards: usize) -> usize {
    (xxh3_64(id.as_bytes()) % total_shards as u64) as usize
}

pub struct DataStore {
    shards: Vec<Arc<ShardStore>>,
    senders: RwLock<Arc<Vec<tokio::sync::mpsc::Sender<WriteCommand>>>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    msink: Arc<MetricsSink>,
}

impl DataStore {
    /// Load or create the shard set and start one writer per shard.
    pub async fn open(
        config: DataStoreConfig,
        msink: Arc<MetricsSink>,
    ) -> Result<DataStore, DataError> {
        let loader = ShardLoader::new(config.directories.clone(), config.clear);
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|_| DataError::ShutDown)??;

        let mut shards = Vec::with_capacity(loaded.len());
        let mut senders = Vec::with_capacity(loaded.len());
        let mut tasks = Vec::with_capacity(loaded.len() + 1);
        let mut latency = Vec::with_capacity(loaded.len());
        for shard in loaded {
            let ring = Arc::new(Mutex::new(CircBufU32::new(COMMIT_LATENCY_SLOTS)));
            let writer = ShardWriter::spawn(
                shard.info.shard_index,
                Arc::clone(&shard.store),
                config.writer.clone(),
                Arc::clone(&msink),
                Arc::clone(&ring),
            );
            shards.push(shard.store);
            senders.push(writer.tx);
            tasks.push(writer.task);
            latency.push(ring);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tasks.push(tokio::spawn(heartbeat_loop(
            config.heartbeat_period,
            latency,
            shutdown_rx,
        )));

        tracing::info!(shards = shards.len(), "Datastore ready");
        Ok(DataStore {
            shards,
            senders: RwLock::new(Arc::new(senders)),
            tasks: tokio::sync::Mutex::new(tasks),
            shutdown_tx,
            msink,
        })
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn metrics(&self) -> &Arc<MetricsSink> {
        &self.msink
    }

    /// Writer queues for a new ingestor.
    pub(crate) fn writer_queues(&self) -> Arc<Vec<tokio::sync::mpsc::Sender<WriteCommand>>> {
        Arc::clone(&self.senders.read())
    }

    /// Wait until everything enqueued so far is committed on every shard.
    pub async fn flush(&self) -> Result<(), DataError> {
        let senders = self.writer_queues();
        let mut acks = Vec::with_capacity(senders.len());
        for tx in senders.iter() {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(WriteCommand::Flush(ack_tx))
                .await
                .map_err(|_| DataError::ShutDown)?;
            acks.push(ack_rx);
        }
        for ack in acks {
            ack.await.map_err(|_| DataError::ShutDown)?;
        }
        Ok(())
    }

    /// Point lookup by span id on the owning shard.
    pub async fn find_span(&self, id: SpanId) -> Result<Option<Span>, DataError> {
        let shard = Arc::clone(&self.shards[shard_for_id(&id, self.shards.len())]);
        tokio::task::spawn_blocking(move || {
            match shard.get(&index::primary_key(&id))? {
                Some(bytes) => Ok(Some(decode(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|_| DataError::ShutDown)?
    }

    /// Ids of up to `limit` children of the given span, gathered from every
    /// shard in shard order.
    pub async fn find_children(
        &self,
        parent: SpanId,
        limit: usize,
    ) -> Result<Vec<SpanId>, DataError> {
        let mut children = Vec::new();
        for shard in &self.shards {
            if children.len() >= limit {
                break;
            }
            let shard = Arc::clone(shard);
            let remaining = limit - children.len();
            let found = tokio::task::spawn_blocking(move || {
                let prefix = index::child_prefix(&parent);
                let mut out = Vec::new();
                for kv in shard.prefix_scan(&prefix) {
                    let (key, _) = kv?;
                    if let Some(child) = index::id_from_index_key(key.as_ref()) {
                        out.push(child);
                        if out.len() >= remaining {
                            break;
                        }
                    }
                }
                Ok::<_, DataError>(out)
            })
            .await
            .map_err(|_| DataError::ShutDown)??;
            children.extend(found);
        }
        Ok(children)
    }

    /// Plan the query once, scan every shard in parallel, merge in scan
    /// order. Returns the result page and the per-shard scanned counts.
    pub async fn handle_query(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<(Vec<Span>, Vec<u64>), DataError> {
        let plan = Arc::new(ScanPlan::build(query)?);
        let started = std::time::Instant::now();

        let scans = self.shards.iter().map(|shard| {
            let shard = Arc::clone(shard);
            let plan = Arc::clone(&plan);
            tokio::task::spawn_blocking(move || query::scan_shard(&shard, &plan))
        });
        let joined = futures::future::join_all(scans);
        let results = match timeout {
            Some(limit) => tokio::time::timeout(limit, joined).await.map_err(|_| {
                DataError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                }
            })?,
            None => joined.await,
        };

        let mut per_shard = Vec::with_capacity(self.shards.len());
        let mut scanned = Vec::with_capacity(self.shards.len());
        for result in results {
            let ShardScanResult { hits, scanned: n } =
                result.map_err(|_| DataError::ShutDown)??;
            per_shard.push(hits);
            scanned.push(n);
        }

        let spans = query::merge_shard_results(per_shard, plan.reverse(), plan.limit());
        tracing::debug!(
            results = spans.len(),
            scanned = scanned.iter().sum::<u64>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query executed"
        );
        Ok((spans, scanned))
    }

    /// Stop the writers, drain their queues, and persist every shard.
    /// The metrics sink stays up so draining writers can report.
    pub async fn shutdown(&self) {
        tracing::debug!("Datastore shutting down");
        let _ = self.shutdown_tx.send(true);
        // Dropping every queue sender lets the writers drain and exit.
        *self.senders.write() = Arc::new(Vec::new());
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!("Datastore shutdown complete");
    }
}

/// Periodically report per-shard commit latencies.
async fn heartbeat_loop(
    period: Duration,
    latency: Vec<Arc<Mutex<CircBufU32>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for (shard, ring) in latency.iter().enumerate() {
                    let ring = ring.lock();
                    tracing::debug!(
                        shard,
                        commit_avg_us = ring.average(),
                        commit_max_us = ring.max(),
                        "Datastore heartbeat"
                    );
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
