//! Core span data types shared across the storage, ingestion, and API layers

pub mod codec;
pub mod span;

pub use codec::{CodecError, SpanRecord, WriteSpansRequest, decode, encode};
pub use span::{Span, SpanId, SpanIdParseError, TimelineAnnotation, TraceInfoMap};
