//! Index key families
//!
//! Every shard's key/value store carries several key families, distinguished
//! by a one-byte prefix:
//!
//! | Prefix | Key                      | Value        |
//! |--------|--------------------------|--------------|
//! | `P`    | span-id                  | encoded span |
//! | `C`    | parent-id, child-id      | empty        |
//! | `B`    | begin-ms(be), span-id    | empty        |
//! | `E`    | end-ms(be), span-id      | empty        |
//! | `D`    | duration(be), span-id    | empty        |
//! | `S`    | description, 0x00, span-id | empty      |
//! | `T`    | tracer-id, 0x00, span-id | empty        |
//!
//! Integers are big-endian with the sign bit flipped so that lexicographic
//! scan order equals numeric order, negatives first. String families carry a
//! 0x00 separator before the span id so entries for "a" can never interleave
//! with entries for "ab".

use crate::data::types::{Span, SpanId, encode};

pub const PRIMARY: u8 = b'P';
pub const CHILDREN: u8 = b'C';
pub const BEGIN_TIME: u8 = b'B';
pub const END_TIME: u8 = b'E';
pub const DURATION: u8 = b'D';
pub const DESCRIPTION: u8 = b'S';
pub const TRACER_ID: u8 = b'T';

const STRING_SEP: u8 = 0x00;

/// Encode a signed millisecond value so byte order matches numeric order.
pub fn encode_time(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub fn decode_time(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64
}

pub fn primary_key(id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + SpanId::LENGTH);
    key.push(PRIMARY);
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn child_key(parent: &SpanId, child: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 2 * SpanId::LENGTH);
    key.push(CHILDREN);
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(child.as_bytes());
    key
}

/// Prefix under which all children of `parent` are stored.
pub fn child_prefix(parent: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + SpanId::LENGTH);
    key.push(CHILDREN);
    key.extend_from_slice(parent.as_bytes());
    key
}

pub fn time_key(family: u8, value: i64, id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + SpanId::LENGTH);
    key.push(family);
    key.extend_from_slice(&encode_time(value));
    key.extend_from_slice(id.as_bytes());
    key
}

pub fn string_key(family: u8, value: &str, id: &SpanId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + value.len() + SpanId::LENGTH);
    key.push(family);
    key.extend_from_slice(value.as_bytes());
    key.push(STRING_SEP);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Scan-start prefix for an integer-valued family at `value`.
pub fn time_prefix(family: u8, value: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(family);
    key.extend_from_slice(&encode_time(value));
    key
}

/// Scan-start prefix for a string-valued family at `value` (inclusive of all
/// ids under that exact value).
pub fn string_prefix(family: u8, value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + value.len());
    key.push(family);
    key.extend_from_slice(value.as_bytes());
    key.push(STRING_SEP);
    key
}

/// Smallest key strictly greater than every key starting with `prefix`, or
/// None when no such key exists (all 0xff).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last != 0xff {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// The span id carried in the trailing bytes of a secondary-index key.
pub fn id_from_index_key(key: &[u8]) -> Option<SpanId> {
    if key.len() < 1 + SpanId::LENGTH {
        return None;
    }
    let tail: [u8; SpanId::LENGTH] = key[key.len() - SpanId::LENGTH..].try_into().ok()?;
    Some(SpanId::from_bytes(tail))
}

/// All key/value pairs written for one span: the primary record, one child
/// edge per parent, and one entry per secondary family.
pub fn span_entries(span: &Span) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut entries = Vec::with_capacity(6 + span.parents.len());
    entries.push((primary_key(&span.id), encode(span)));
    for parent in &span.parents {
        entries.push((child_key(parent, &span.id), Vec::new()));
    }
    entries.push((time_key(BEGIN_TIME, span.begin, &span.id), Vec::new()));
    entries.push((time_key(END_TIME, span.end, &span.id), Vec::new()));
    entries.push((time_key(DURATION, span.duration(), &span.id), Vec::new()));
    entries.push((string_key(DESCRIPTION, &span.description, &span.id), Vec::new()));
    entries.push((string_key(TRACER_ID, &span.tracer_id, &span.id), Vec::new()));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::types::TraceInfoMap;

    fn id(hex: &str) -> SpanId {
        hex.parse().unwrap()
    }

    #[test]
    fn test_time_encoding_preserves_order() {
        let values = [i64::MIN, -1000, -1, 0, 1, 125, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                encode_time(pair[0]) < encode_time(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
        for v in values {
            assert_eq!(decode_time(encode_time(v)), v);
        }
    }

    #[test]
    fn test_string_keys_do_not_interleave() {
        let low = id("00000000000000000000000000000001");
        let high = id("ffffffffffffffffffffffffffffffff");
        // Every key for "a" sorts before every key for "ab", regardless of id.
        assert!(string_key(DESCRIPTION, "a", &high) < string_key(DESCRIPTION, "ab", &low));
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[b'B', 0x00]), Some(vec![b'B', 0x01]));
        assert_eq!(prefix_successor(&[b'B', 0xff]), Some(vec![b'C']));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_span_entries_shape() {
        let span = Span {
            id: id("00000000000000000000000000000002"),
            begin: 125,
            end: 200,
            description: "openFd".to_string(),
            tracer_id: "secondd".to_string(),
            parents: vec![id("00000000000000000000000000000001")],
            info: TraceInfoMap::new(),
            timeline: vec![],
        };
        let entries = span_entries(&span);
        // One primary, one child edge, five secondary entries.
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[0].0[0], PRIMARY);
        assert_eq!(entries[1].0[0], CHILDREN);
        assert_eq!(id_from_index_key(&entries[1].0), Some(span.id));
        for (key, value) in &entries[2..] {
            assert!(value.is_empty());
            assert_eq!(id_from_index_key(key), Some(span.id));
        }
    }
}
