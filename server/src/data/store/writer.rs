//! Shard writer
//!
//! One long-lived worker per shard owns that shard's store for mutation.
//! Spans arrive on a bounded queue; the worker drains up to a batch cap or
//! until the flush interval elapses, derives every index entry, and commits
//! the whole thing as one atomic batch. Spans enqueued by the same ingestor
//! onto the same shard commit in enqueue order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::data::store::index;
use crate::data::store::shard::ShardStore;
use crate::data::types::Span;
use crate::domain::metrics::{MetricsSink, SpanMetrics, SpanMetricsMap};
use crate::utils::circbuf::CircBufU32;

/// A unit of work for a shard writer.
pub enum WriteCommand {
    /// Persist one span, attributed to the given origin address.
    Span { span: Box<Span>, origin: String },
    /// Commit everything enqueued so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct ShardWriterConfig {
    pub queue_capacity: usize,
    pub batch_max_spans: usize,
    pub flush_interval: Duration,
}

impl Default for ShardWriterConfig {
    fn default() -> Self {
        ShardWriterConfig {
            queue_capacity: 1024,
            batch_max_spans: 128,
            flush_interval: Duration::from_millis(50),
        }
    }
}

/// A running shard writer: its queue plus the worker task.
pub struct ShardWriter {
    pub tx: mpsc::Sender<WriteCommand>,
    pub task: JoinHandle<()>,
}

impl ShardWriter {
    pub fn spawn(
        shard_index: u32,
        store: Arc<ShardStore>,
        config: ShardWriterConfig,
        msink: Arc<MetricsSink>,
        latency: Arc<Mutex<CircBufU32>>,
    ) -> ShardWriter {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let task = tokio::spawn(run_writer(shard_index, store, config, msink, latency, rx));
        ShardWriter { tx, task }
    }
}

async fn run_writer(
    shard_index: u32,
    store: Arc<ShardStore>,
    config: ShardWriterConfig,
    msink: Arc<MetricsSink>,
    latency: Arc<Mutex<CircBufU32>>,
    mut rx: mpsc::Receiver<WriteCommand>,
) {
    tracing::debug!(shard = shard_index, "Shard writer started");
    let mut closed = false;

    while !closed {
        let Some(first) = rx.recv().await else {
            break;
        };

        let mut spans: Vec<Box<Span>> = Vec::new();
        let mut origins: Vec<String> = Vec::new();
        let mut acks: Vec<oneshot::Sender<()>> = Vec::new();
        match first {
            WriteCommand::Span { span, origin } => {
                spans.push(span);
                origins.push(origin);
            }
            WriteCommand::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        }

        // Coalesce whatever else arrives within the flush interval, up to the
        // batch cap.
        let deadline = tokio::time::Instant::now() + config.flush_interval;
        while spans.len() < config.batch_max_spans {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(WriteCommand::Span { span, origin })) => {
                    spans.push(span);
                    origins.push(origin);
                }
                Ok(Some(WriteCommand::Flush(ack))) => {
                    acks.push(ack);
                    break;
                }
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let started = std::time::Instant::now();
        let mut entries = Vec::with_capacity(spans.len() * 7);
        for span in &spans {
            entries.extend(index::span_entries(span));
        }
        if let Err(e) = store.put_batch(&entries) {
            // A failing shard store is not recoverable from here; drop the
            // queue so ingestors see the shard as gone.
            tracing::error!(shard = shard_index, error = %e, "Shard batch commit failed, writer exiting");
            break;
        }
        latency
            .lock()
            .append(started.elapsed().as_micros().min(u32::MAX as u128) as u32);

        let mut written: SpanMetricsMap = HashMap::new();
        for origin in origins {
            written
                .entry(origin)
                .or_insert_with(SpanMetrics::default)
                .written += 1;
        }
        msink.update(written).await;

        for ack in acks {
            let _ = ack.send(());
        }

        tracing::trace!(shard = shard_index, spans = spans.len(), "Committed batch");
    }

    if let Err(e) = store.close() {
        tracing::warn!(shard = shard_index, error = %e, "Shard persist on close failed");
    }
    tracing::debug!(shard = shard_index, "Shard writer shutdown complete");
}
