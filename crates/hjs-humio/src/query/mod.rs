//! Query request model and the query language builder

pub mod builder;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// A query sent to the search endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub query_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<QueryTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<QueryTime>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, String>,
}

impl Query {
    pub fn new(query_string: impl Into<String>) -> Self {
        Self {
            query_string: query_string.into(),
            start: None,
            end: None,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_start(mut self, start: QueryTime) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: QueryTime) -> Self {
        self.end = Some(end);
        self
    }

    /// Restrict to the absolute window `[start, end]`
    pub fn between(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.with_start(QueryTime::Absolute(start))
            .with_end(QueryTime::Absolute(end))
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    /// The synchronous endpoint cannot run joins; those go through a query job
    ///
    /// Only `join(` outside quoted filter values counts.
    pub fn requires_job(&self) -> bool {
        const JOIN: &[u8] = b"join(";
        let query = self.query_string.as_bytes();
        let mut quoted = false;
        let mut escaped = false;
        for (i, &b) in query.iter().enumerate() {
            if quoted {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    quoted = false;
                }
            } else if b == b'"' {
                quoted = true;
            } else if query
                .get(i..i + JOIN.len())
                .is_some_and(|word| word.eq_ignore_ascii_case(JOIN))
            {
                return true;
            }
        }
        false
    }
}

/// Start or end bound of a query
///
/// Relative times use the backend's relative time syntax ("1 day",
/// "24 hours") and serialize as strings; absolute times serialize as epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTime {
    Relative(String),
    Absolute(DateTime<Utc>),
}

impl QueryTime {
    pub fn relative(time: impl Into<String>) -> Self {
        QueryTime::Relative(time.into())
    }
}

impl From<DateTime<Utc>> for QueryTime {
    fn from(time: DateTime<Utc>) -> Self {
        QueryTime::Absolute(time)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QueryTimeRepr {
    Millis(i64),
    Relative(String),
}

impl Serialize for QueryTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            QueryTime::Relative(time) => QueryTimeRepr::Relative(time.clone()),
            QueryTime::Absolute(time) => QueryTimeRepr::Millis(time.timestamp_millis()),
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match QueryTimeRepr::deserialize(deserializer)? {
            QueryTimeRepr::Relative(time) => Ok(QueryTime::Relative(time)),
            QueryTimeRepr::Millis(millis) => DateTime::from_timestamp_millis(millis)
                .map(QueryTime::Absolute)
                .ok_or_else(|| de::Error::custom(format!("timestamp out of range: {millis}"))),
        }
    }
}
