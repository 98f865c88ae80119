//! Binary span codec
//!
//! The on-disk and RPC form of a span is a length-delimited protobuf message.
//! Tagged fields keep the format forward compatible: a reader skips tags it
//! does not know about.

use std::collections::BTreeMap;

use prost::Message;
use thiserror::Error;

use super::span::{Span, SpanId, TimelineAnnotation};

/// Wire form of a single span.
#[derive(Clone, PartialEq, Message)]
pub struct SpanRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(sint64, tag = "2")]
    pub begin: i64,
    #[prost(sint64, tag = "3")]
    pub end: i64,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(string, tag = "5")]
    pub tracer_id: String,
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub parents: Vec<Vec<u8>>,
    #[prost(btree_map = "string, bytes", tag = "7")]
    pub info: BTreeMap<String, Vec<u8>>,
    #[prost(message, repeated, tag = "8")]
    pub timeline: Vec<TimelineRecord>,
}

/// Wire form of one timeline annotation.
#[derive(Clone, PartialEq, Message)]
pub struct TimelineRecord {
    #[prost(sint64, tag = "1")]
    pub time: i64,
    #[prost(string, tag = "2")]
    pub msg: String,
}

/// Wire form of a packed writeSpans request (HRPC body).
#[derive(Clone, PartialEq, Message)]
pub struct WriteSpansRequest {
    #[prost(string, tag = "1")]
    pub default_tracer_id: String,
    #[prost(message, repeated, tag = "2")]
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to decode span record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Span id must be {expected} bytes, got {got}")]
    BadIdLength { expected: usize, got: usize },

    #[error("Span id is invalid (all zero)")]
    InvalidId,
}

/// Encode a span to its length-delimited binary form.
pub fn encode(span: &Span) -> Vec<u8> {
    SpanRecord::from(span).encode_length_delimited_to_vec()
}

/// Decode a span from its length-delimited binary form.
pub fn decode(bytes: &[u8]) -> Result<Span, CodecError> {
    let record = SpanRecord::decode_length_delimited(bytes)?;
    Span::try_from(record)
}

fn id_from_bytes(bytes: &[u8]) -> Result<SpanId, CodecError> {
    let arr: [u8; SpanId::LENGTH] = bytes.try_into().map_err(|_| CodecError::BadIdLength {
        expected: SpanId::LENGTH,
        got: bytes.len(),
    })?;
    Ok(SpanId::from_bytes(arr))
}

impl From<&Span> for SpanRecord {
    fn from(span: &Span) -> Self {
        SpanRecord {
            id: span.id.as_bytes().to_vec(),
            begin: span.begin,
            end: span.end,
            description: span.description.clone(),
            tracer_id: span.tracer_id.clone(),
            parents: span.parents.iter().map(|p| p.as_bytes().to_vec()).collect(),
            info: span.info.clone(),
            timeline: span
                .timeline
                .iter()
                .map(|t| TimelineRecord {
                    time: t.time,
                    msg: t.msg.clone(),
                })
                .collect(),
        }
    }
}

impl TryFrom<SpanRecord> for Span {
    type Error = CodecError;

    fn try_from(record: SpanRecord) -> Result<Self, Self::Error> {
        let id = id_from_bytes(&record.id)?;
        if id.is_invalid() {
            return Err(CodecError::InvalidId);
        }
        let parents = record
            .parents
            .iter()
            .map(|p| id_from_bytes(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Span {
            id,
            begin: record.begin,
            end: record.end,
            description: record.description,
            tracer_id: record.tracer_id,
            parents,
            info: record.info,
            timeline: record
                .timeline
                .into_iter()
                .map(|t| TimelineAnnotation {
                    time: t.time,
                    msg: t.msg,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::span::TraceInfoMap;

    fn id(hex: &str) -> SpanId {
        hex.parse().unwrap()
    }

    fn sample() -> Span {
        Span {
            id: id("00000000000000000000000000000001"),
            begin: 123,
            end: 456,
            description: "getFileDescriptors".to_string(),
            tracer_id: "firstd".to_string(),
            parents: vec![],
            info: TraceInfoMap::new(),
            timeline: vec![],
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let span = sample();
        assert_eq!(decode(&encode(&span)).unwrap(), span);
    }

    #[test]
    fn test_binary_round_trip_full() {
        let span = Span {
            id: id("ffffffffffffffff0000000000000001"),
            begin: i64::MIN,
            end: i64::MAX,
            description: "a span with \"quotes\" and unicode ☃".to_string(),
            tracer_id: "tracerd/1".to_string(),
            parents: vec![
                id("00000000000000000000000000000002"),
                id("00000000000000000000000000000003"),
                id("0000000000000000000000000000000f"),
            ],
            info: TraceInfoMap::from([("path".to_string(), b"/tmp/x".to_vec())]),
            timeline: vec![
                TimelineAnnotation {
                    time: -1,
                    msg: "start".to_string(),
                },
                TimelineAnnotation {
                    time: 99,
                    msg: "done".to_string(),
                },
            ],
        };
        assert_eq!(decode(&encode(&span)).unwrap(), span);
    }

    #[test]
    fn test_decode_rejects_zero_id() {
        let mut span = sample();
        span.id = SpanId::INVALID;
        let bytes = encode(&span);
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidId)));
    }

    #[test]
    fn test_decode_rejects_short_id() {
        let record = SpanRecord {
            id: vec![1, 2, 3],
            ..Default::default()
        };
        let bytes = record.encode_length_delimited_to_vec();
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::BadIdLength { expected: 16, got: 3 })
        ));
    }

    #[test]
    fn test_unknown_tags_are_skipped() {
        // A future writer may append fields this reader does not know about.
        // Simulate one by appending a tag-9 varint field to an encoded record.
        let span = sample();
        let mut inner = SpanRecord::from(&span).encode_to_vec();
        inner.extend_from_slice(&[0x48, 0x2a]); // field 9, varint 42
        let mut framed = Vec::new();
        prost::encoding::encode_varint(inner.len() as u64, &mut framed);
        framed.extend_from_slice(&inner);
        assert_eq!(decode(&framed).unwrap(), span);
    }
}
