//! Span model and wire (JSON) form
//!
//! 64-bit-plus quantities travel inside JSON as quoted strings: the browser UI
//! consumes this data directly and JavaScript numbers round above 53 bits.
//! Span ids are therefore always rendered as 32-digit lowercase hex strings,
//! and the millisecond timestamps stay within i64.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 128-bit span identifier.
///
/// Ordering is lexicographic over the big-endian bytes, which is also the
/// numeric order, and matches the on-disk primary index order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SpanId([u8; 16]);

impl SpanId {
    /// The all-zero id. Never a valid span id; rejected at ingest.
    pub const INVALID: SpanId = SpanId([0u8; 16]);

    pub const LENGTH: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SpanId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// The next id in sort order: id + 1 with carry, wrapping at the top.
    pub fn next(&self) -> SpanId {
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (v, overflow) = byte.overflowing_add(1);
            *byte = v;
            if !overflow {
                break;
            }
        }
        SpanId(out)
    }

    /// Whether this is the maximum representable id (next() would wrap).
    pub fn is_max(&self) -> bool {
        self.0 == [0xff; 16]
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self)
    }
}

impl FromStr for SpanId {
    type Err = SpanIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(SpanIdParseError::Length(s.len()));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| SpanIdParseError::NotHex)?;
        }
        Ok(SpanId(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpanIdParseError {
    #[error("Span id must be 32 hex digits, got {0} characters")]
    Length(usize),
    #[error("Span id contains non-hexadecimal characters")]
    NotHex,
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Free-form key/value annotations attached to a span. Values are byte
/// strings; they travel as base64 inside JSON.
pub type TraceInfoMap = BTreeMap<String, Vec<u8>>;

/// One timestamped message on a span's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineAnnotation {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "m")]
    pub msg: String,
}

/// A trace span. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    #[serde(rename = "s")]
    pub id: SpanId,
    #[serde(rename = "b")]
    pub begin: i64,
    #[serde(rename = "e")]
    pub end: i64,
    #[serde(rename = "d", default)]
    pub description: String,
    #[serde(rename = "r", default)]
    pub tracer_id: String,
    #[serde(rename = "p", default)]
    pub parents: Vec<SpanId>,
    #[serde(
        rename = "n",
        default,
        with = "info_b64",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub info: TraceInfoMap,
    #[serde(rename = "t", default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<TimelineAnnotation>,
}

impl Span {
    /// Derived duration in milliseconds. Spans with begin > end are stored
    /// as-is; the duration clamps at zero.
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.begin).max(0)
    }

    /// Sort and dedup the parent set in place.
    pub fn normalize_parents(&mut self) {
        self.parents.sort_unstable();
        self.parents.dedup();
    }

    /// Write the JSON form of this span to the given writer.
    pub fn write_json<W: std::io::Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer(writer, self)
    }
}

/// Serde adapter carrying byte-string map values as base64 strings.
mod info_b64 {
    use std::collections::BTreeMap;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &STANDARD.encode(value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let raw = BTreeMap::<String, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| {
                STANDARD
                    .decode(value.as_bytes())
                    .map(|bytes| (key, bytes))
                    .map_err(D::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(hex: &str) -> SpanId {
        hex.parse().unwrap()
    }

    #[test]
    fn test_span_id_formatting() {
        assert_eq!(
            SpanId::INVALID.to_string(),
            "00000000000000000000000000000000"
        );
        let sid = id("deadbeef00000000000000000000cafe");
        assert_eq!(sid.to_string(), "deadbeef00000000000000000000cafe");
        assert_eq!(sid.to_string().len(), 32);
        assert_eq!(id(&sid.to_string()), sid);
    }

    #[test]
    fn test_span_id_parse_errors() {
        assert!("deadbeef".parse::<SpanId>().is_err());
        assert!(
            "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
                .parse::<SpanId>()
                .is_err()
        );
        assert!(
            "deadbeef00000000000000000000cafe0"
                .parse::<SpanId>()
                .is_err()
        );
    }

    #[test]
    fn test_span_id_next_carries() {
        assert_eq!(
            SpanId::INVALID.next().to_string(),
            "00000000000000000000000000000001"
        );
        let sid = id("000000000000000000000000000000ff");
        assert_eq!(sid.next().to_string(), "00000000000000000000000000000100");
        let max = id("ffffffffffffffffffffffffffffffff");
        assert!(max.is_max());
        assert_eq!(max.next(), SpanId::INVALID);
    }

    #[test]
    fn test_span_id_ordering() {
        let a = id("00000000000000000000000000000001");
        let b = id("00000000000000000000000000000002");
        let c = id("10000000000000000000000000000000");
        assert!(a < b);
        assert!(b < c);
        assert!(SpanId::INVALID < a);
    }

    #[test]
    fn test_span_json_round_trip() {
        let span = Span {
            id: id("00000000000000000000000000000001"),
            begin: 123,
            end: 456,
            description: "getFileDescriptors".to_string(),
            tracer_id: "firstd".to_string(),
            parents: vec![],
            info: TraceInfoMap::new(),
            timeline: vec![],
        };
        let json = serde_json::to_string(&span).unwrap();
        assert!(json.contains(r#""s":"00000000000000000000000000000001""#));
        // Empty info and timeline are omitted from the wire form.
        assert!(!json.contains(r#""n":"#));
        assert!(!json.contains(r#""t":"#));
        let back: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(span, back);
    }

    #[test]
    fn test_span_json_round_trip_extremes() {
        let span = Span {
            id: id("ffffffffffffffffffffffffffffffff"),
            begin: i64::MIN,
            end: i64::MAX,
            description: String::new(),
            tracer_id: String::new(),
            parents: vec![
                id("00000000000000000000000000000002"),
                id("00000000000000000000000000000003"),
            ],
            info: TraceInfoMap::from([
                ("k".to_string(), vec![0u8, 1, 2, 255]),
                ("empty".to_string(), vec![]),
            ]),
            timeline: vec![TimelineAnnotation {
                time: -5,
                msg: "opened".to_string(),
            }],
        };
        let back: Span = serde_json::from_str(&serde_json::to_string(&span).unwrap()).unwrap();
        assert_eq!(span, back);
        assert_eq!(back.duration(), i64::MAX);
    }

    #[test]
    fn test_duration_clamps_at_zero() {
        let span = Span {
            id: id("00000000000000000000000000000001"),
            begin: 500,
            end: 100,
            description: String::new(),
            tracer_id: String::new(),
            parents: vec![],
            info: TraceInfoMap::new(),
            timeline: vec![],
        };
        assert_eq!(span.duration(), 0);
    }

    #[test]
    fn test_normalize_parents() {
        let mut span = Span {
            id: id("00000000000000000000000000000009"),
            begin: 0,
            end: 0,
            description: String::new(),
            tracer_id: String::new(),
            parents: vec![
                id("00000000000000000000000000000002"),
                id("00000000000000000000000000000001"),
                id("00000000000000000000000000000002"),
            ],
            info: TraceInfoMap::new(),
            timeline: vec![],
        };
        span.normalize_parents();
        assert_eq!(
            span.parents,
            vec![
                id("00000000000000000000000000000001"),
                id("00000000000000000000000000000002"),
            ]
        );
    }
}
