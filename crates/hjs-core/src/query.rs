//! Parameters and results of the span reader operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Trace search parameters
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TraceQueryParameters {
    pub service_name: Option<String>,
    pub operation_name: Option<String>,
    /// Tag equality filters, matched against flattened event attributes
    pub tags: BTreeMap<String, String>,
    pub start_time_min: DateTime<Utc>,
    pub start_time_max: DateTime<Utc>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
    /// Maximum number of traces; 0 means use the reader default
    pub num_traces: usize,
}

impl TraceQueryParameters {
    /// Requested trace limit, falling back to `default` when unset
    pub fn limit_or(&self, default: usize) -> usize {
        if self.num_traces == 0 {
            default
        } else {
            self.num_traces
        }
    }

    /// Width of the requested time window (zero if inverted)
    pub fn window(&self) -> Duration {
        (self.start_time_max - self.start_time_min)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Operation lookup parameters
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationQueryParameters {
    /// Restrict to one service; `None` lists operations of every service
    pub service_name: Option<String>,
    pub span_kind: Option<String>,
}

/// A known operation of a service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub span_kind: String,
}

/// Call-count edge between two services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
    pub source: String,
}
