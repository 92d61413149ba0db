//! Span and trace model
//!
//! This is the shape spans take inside the `payload` attribute of every
//! stored event. Field names are snake_case and ids are hex strings; the
//! dependency join query relies on `span_id`, `references[0].span_id` and
//! `process.service_name` being present under exactly these names.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Error returned when a trace or span id is not valid hex
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid id {input:?}: {reason}")]
pub struct ParseIdError {
    input: String,
    reason: &'static str,
}

impl ParseIdError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

fn parse_hex_u64(input: &str, digits: &str) -> Result<u64, ParseIdError> {
    u64::from_str_radix(digits, 16).map_err(|_| ParseIdError::new(input, "not hexadecimal"))
}

/// 128-bit trace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TraceId {
    pub high: u64,
    pub low: u64,
}

impl TraceId {
    pub fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:016x}", self.low)
        } else {
            write!(f, "{:016x}{:016x}", self.high, self.low)
        }
    }
}

impl FromStr for TraceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdError::new(s, "empty"));
        }
        if s.len() > 32 {
            return Err(ParseIdError::new(s, "longer than 32 hex digits"));
        }
        if !s.is_ascii() {
            return Err(ParseIdError::new(s, "not hexadecimal"));
        }

        if s.len() > 16 {
            let (high, low) = s.split_at(s.len() - 16);
            Ok(Self {
                high: parse_hex_u64(s, high)?,
                low: parse_hex_u64(s, low)?,
            })
        } else {
            Ok(Self {
                high: 0,
                low: parse_hex_u64(s, s)?,
            })
        }
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// 64-bit span identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for SpanId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseIdError::new(s, "empty"));
        }
        if s.len() > 16 {
            return Err(ParseIdError::new(s, "longer than 16 hex digits"));
        }
        Ok(Self(parse_hex_u64(s, s)?))
    }
}

impl Serialize for SpanId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Type of the value carried by a [`KeyValue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueType {
    #[default]
    String,
    Bool,
    Int64,
    Float64,
    Binary,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

/// A typed tag on a span, a log or a process
///
/// Only the field matching `v_type` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub v_type: ValueType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub v_str: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub v_bool: bool,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub v_int64: i64,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub v_float64: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub v_binary: Vec<u8>,
}

impl KeyValue {
    fn empty(key: impl Into<String>, v_type: ValueType) -> Self {
        Self {
            key: key.into(),
            v_type,
            v_str: String::new(),
            v_bool: false,
            v_int64: 0,
            v_float64: 0.0,
            v_binary: Vec::new(),
        }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            v_str: value.into(),
            ..Self::empty(key, ValueType::String)
        }
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            v_bool: value,
            ..Self::empty(key, ValueType::Bool)
        }
    }

    pub fn int64(key: impl Into<String>, value: i64) -> Self {
        Self {
            v_int64: value,
            ..Self::empty(key, ValueType::Int64)
        }
    }

    pub fn float64(key: impl Into<String>, value: f64) -> Self {
        Self {
            v_float64: value,
            ..Self::empty(key, ValueType::Float64)
        }
    }

    pub fn binary(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            v_binary: value.into(),
            ..Self::empty(key, ValueType::Binary)
        }
    }

    /// String form used for event attributes and tag matching.
    ///
    /// Floating point and binary values have no stable string form and
    /// return `None`.
    pub fn as_filter_string(&self) -> Option<String> {
        match self.v_type {
            ValueType::String => Some(self.v_str.clone()),
            ValueType::Int64 => Some(self.v_int64.to_string()),
            ValueType::Bool => Some(if self.v_bool { "true" } else { "false" }.to_string()),
            ValueType::Float64 | ValueType::Binary => None,
        }
    }
}

/// Kind of relationship between two spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanRefType {
    #[default]
    ChildOf,
    FollowsFrom,
}

/// Reference from one span to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRef {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(default)]
    pub ref_type: SpanRefType,
}

/// Timestamped set of fields attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<KeyValue>,
}

/// The emitting service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Process {
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<KeyValue>,
}

/// One timed operation within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub operation_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<SpanRef>,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub flags: u32,
    pub start_time: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<Log>,
    #[serde(default)]
    pub process: Process,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Span {
    pub fn service_name(&self) -> &str {
        &self.process.service_name
    }
}

/// Spans sharing one trace id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: TraceId,
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn new(trace_id: TraceId) -> Self {
        Self {
            trace_id,
            spans: Vec::new(),
        }
    }
}

/// Serialize a `Duration` as integer nanoseconds
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_span() -> Span {
        Span {
            trace_id: TraceId::new(0, 0xabc),
            span_id: SpanId(0x10),
            operation_name: "GET /dispatch".to_string(),
            references: vec![SpanRef {
                trace_id: TraceId::new(0, 0xabc),
                span_id: SpanId(0x01),
                ref_type: SpanRefType::ChildOf,
            }],
            flags: 1,
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            duration: Duration::from_millis(42),
            tags: vec![KeyValue::string("http.method", "GET")],
            logs: Vec::new(),
            process: Process {
                service_name: "frontend".to_string(),
                tags: vec![KeyValue::string("hostname", "host-1")],
            },
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_trace_id_display() {
        assert_eq!(TraceId::new(0, 0xabc).to_string(), "0000000000000abc");
        assert_eq!(
            TraceId::new(1, 2).to_string(),
            "00000000000000010000000000000002"
        );
    }

    #[test]
    fn test_trace_id_parse() {
        assert_eq!("abc".parse::<TraceId>().unwrap(), TraceId::new(0, 0xabc));
        assert_eq!(
            "10000000000000002".parse::<TraceId>().unwrap(),
            TraceId::new(1, 2)
        );
        assert!("".parse::<TraceId>().is_err());
        assert!("xyz".parse::<TraceId>().is_err());
        assert!("1".repeat(33).parse::<TraceId>().is_err());
    }

    #[test]
    fn test_span_id_parse() {
        assert_eq!("00000000000000ff".parse::<SpanId>().unwrap(), SpanId(255));
        assert!("1".repeat(17).parse::<SpanId>().is_err());
    }

    #[test]
    fn test_filter_string() {
        assert_eq!(KeyValue::string("k", "v").as_filter_string().as_deref(), Some("v"));
        assert_eq!(KeyValue::int64("k", -7).as_filter_string().as_deref(), Some("-7"));
        assert_eq!(KeyValue::bool("k", true).as_filter_string().as_deref(), Some("true"));
        assert_eq!(KeyValue::bool("k", false).as_filter_string().as_deref(), Some("false"));
        assert_eq!(KeyValue::float64("k", 1.5).as_filter_string(), None);
        assert_eq!(KeyValue::binary("k", vec![1, 2]).as_filter_string(), None);
    }

    #[test]
    fn test_span_payload_field_names() {
        let json = serde_json::to_value(sample_span()).unwrap();

        assert_eq!(json["trace_id"], "0000000000000abc");
        assert_eq!(json["span_id"], "0000000000000010");
        assert_eq!(json["references"][0]["span_id"], "0000000000000001");
        assert_eq!(json["process"]["service_name"], "frontend");
        assert_eq!(json["duration"], 42_000_000);
        assert_eq!(json["tags"][0]["v_type"], "STRING");
    }

    #[test]
    fn test_span_json_decodes_back() {
        let span = sample_span();
        let json = serde_json::to_string(&span).unwrap();
        let decoded: Span = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, span);
        assert_eq!(decoded.references[0].span_id, SpanId(0x01));
    }
}
