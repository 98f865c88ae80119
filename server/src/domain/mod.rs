//! Ingestion-side services: per-peer span ingestors and the metrics sink

pub mod ingest;
pub mod metrics;

pub use ingest::SpanIngestor;
pub use metrics::{MetricsSink, MetricsSinkConfig, ServerTotals, SpanMetrics, SpanMetricsMap};
