//! Span ingestor
//!
//! One ingestor per remote peer. It routes each span to the owning shard's
//! writer queue by a stable hash of the span id, fills in the peer's default
//! tracer id, and accounts every span it had to drop. Closing the ingestor
//! flushes the drop counters into the metrics sink.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;

use crate::data::error::DataError;
use crate::data::store::writer::WriteCommand;
use crate::data::store::{DataStore, shard_for_id};
use crate::data::types::Span;
use crate::domain::metrics::{MetricsSink, SpanMetrics, SpanMetricsMap};

pub struct SpanIngestor {
    remote_addr: String,
    default_tracer_id: String,
    queues: Arc<Vec<tokio::sync::mpsc::Sender<WriteCommand>>>,
    msink: Arc<MetricsSink>,
    dropped: u64,
    opened_at: DateTime<Utc>,
}

impl SpanIngestor {
    pub fn new(store: &DataStore, remote_addr: &str, default_tracer_id: &str) -> SpanIngestor {
        SpanIngestor {
            remote_addr: remote_addr.to_string(),
            default_tracer_id: default_tracer_id.to_string(),
            queues: store.writer_queues(),
            msink: Arc::clone(store.metrics()),
            dropped: 0,
            opened_at: Utc::now(),
        }
    }

    /// Enqueue one span without blocking. A full shard queue drops the span
    /// and counts it against this peer; only a span that can never be stored
    /// (zero id) is an error, and it does not poison the rest of the batch.
    pub fn ingest(&mut self, span: Span) -> Result<(), DataError> {
        let Some(command) = self.prepare(span)? else {
            return Ok(());
        };
        let shard = self.shard_of(&command);
        match self.queues[shard].try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::debug!(
                    origin = %self.remote_addr,
                    shard,
                    "Shard queue full, dropping span"
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(DataError::ShutDown),
        }
    }

    /// Enqueue one span, waiting for queue room instead of dropping.
    pub async fn ingest_wait(&mut self, span: Span) -> Result<(), DataError> {
        let Some(command) = self.prepare(span)? else {
            return Ok(());
        };
        let shard = self.shard_of(&command);
        self.queues[shard]
            .send(command)
            .await
            .map_err(|_| DataError::ShutDown)
    }

    fn prepare(&mut self, mut span: Span) -> Result<Option<WriteCommand>, DataError> {
        if self.queues.is_empty() {
            return Err(DataError::ShutDown);
        }
        if span.id.is_invalid() {
            self.dropped += 1;
            return Err(DataError::BadSpan(format!(
                "Rejecting span from {} with an invalid (zero) id",
                self.remote_addr
            )));
        }
        if span.tracer_id.is_empty() {
            span.tracer_id = self.default_tracer_id.clone();
        }
        span.normalize_parents();
        Ok(Some(WriteCommand::Span {
            span: Box::new(span),
            origin: self.remote_addr.clone(),
        }))
    }

    fn shard_of(&self, command: &WriteCommand) -> usize {
        match command {
            WriteCommand::Span { span, .. } => shard_for_id(&span.id, self.queues.len()),
            WriteCommand::Flush(_) => 0,
        }
    }

    /// Flush the owed drop accounting into the metrics sink.
    pub async fn close(self, now: DateTime<Utc>) {
        if self.dropped > 0 {
            self.msink
                .update(SpanMetricsMap::from([(
                    self.remote_addr.clone(),
                    SpanMetrics::dropped(self.dropped),
                )]))
                .await;
        }
        let lifetime_ms = (now - self.opened_at).num_milliseconds().max(0);
        self.msink
            .record_ingest_time(lifetime_ms.min(u32::MAX as i64) as u32)
            .await;
    }
}
