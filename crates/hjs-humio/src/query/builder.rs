//! Query string construction
//!
//! Everything here is pure string building. Untrusted values only ever reach
//! a query through [`escape_field_filter`].

use hjs_core::TraceQueryParameters;
use std::collections::BTreeMap;
use std::time::Duration;

/// Tag field carrying the service name
pub const SERVICE_FIELD: &str = "#service";
pub const OPERATION_FIELD: &str = "operation";
pub const TRACE_ID_FIELD: &str = "traceid";
pub const PAYLOAD_FIELD: &str = "payload";
pub const DURATION_FIELD: &str = "duration_ms";

/// Inactivity pause closing a trace session
pub const SESSION_PAUSE: Duration = Duration::from_secs(5 * 60);

/// Escape a value for use inside a quoted field filter
///
/// Only `\` and `"` are escaped. The backend has no escape for the `*`
/// wildcard, so a `*` in a value still matches as a wildcard.
pub fn escape_field_filter(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '"' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `name="value"`
pub fn field_filter(name: &str, value: &str) -> String {
    format!("{}=\"{}\"", name, escape_field_filter(value))
}

/// Space separated equality filters
pub fn field_filters<'a, I>(filters: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    filters
        .into_iter()
        .map(|(name, value)| field_filter(name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Duration bound filters in milliseconds; zero bounds are ignored
pub fn duration_filters(min: Option<Duration>, max: Option<Duration>) -> Vec<String> {
    let mut filters = Vec::new();
    if let Some(min) = min.filter(|d| !d.is_zero()) {
        filters.push(format!("{} > {}", DURATION_FIELD, min.as_millis()));
    }
    if let Some(max) = max.filter(|d| !d.is_zero()) {
        filters.push(format!("{} < {}", DURATION_FIELD, max.as_millis()));
    }
    filters
}

/// `(traceid="a" OR traceid="b")`, or `None` when there are no ids
pub fn trace_id_disjunction<S: AsRef<str>>(trace_ids: &[S]) -> Option<String> {
    if trace_ids.is_empty() {
        return None;
    }
    let clauses = trace_ids
        .iter()
        .map(|id| field_filter(TRACE_ID_FIELD, id.as_ref()))
        .collect::<Vec<_>>();
    Some(format!("({})", clauses.join(" OR ")))
}

/// Render a duration in the backend's duration syntax: `5m`, `90s`, `250ms`
pub fn format_pause(pause: Duration) -> String {
    let millis = pause.as_millis();
    if millis > 0 && millis % 60_000 == 0 {
        format!("{}m", millis / 60_000)
    } else if millis > 0 && millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

/// Group rows into per-trace sessions collecting every payload
pub fn session_by_trace(pause: Duration) -> String {
    format!(
        "groupBy(field={}, function=session(maxpause={}, collect([{}], multival=true)))",
        TRACE_ID_FIELD,
        format_pause(pause),
        PAYLOAD_FIELD
    )
}

/// Candidate trace ids with the time range each was seen in
pub fn group_by_trace_with_bounds(limit: usize) -> String {
    format!(
        "groupBy({}, limit={}, function=[min(@timestamp), max(@timestamp)])",
        TRACE_ID_FIELD, limit
    )
}

/// Service to operation catalog
pub fn group_by_service_operation() -> String {
    format!(
        "groupBy({}, function=groupBy({}))",
        SERVICE_FIELD, OPERATION_FIELD
    )
}

pub fn head(limit: usize) -> String {
    format!("head({})", limit)
}

/// Join non-empty stages with `|`
pub fn pipeline<S: AsRef<str>>(stages: &[S]) -> String {
    stages
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Filter half of a trace search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub duration_min: Option<Duration>,
    pub duration_max: Option<Duration>,
}

impl TraceFilter {
    pub fn from_params(params: &TraceQueryParameters) -> Self {
        Self {
            service: params.service_name.clone().filter(|s| !s.is_empty()),
            operation: params.operation_name.clone().filter(|s| !s.is_empty()),
            tags: params.tags.clone(),
            duration_min: params.duration_min,
            duration_max: params.duration_max,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_query_string().is_empty()
    }

    /// Space separated filter expression; empty when nothing is filtered
    pub fn to_query_string(&self) -> String {
        let mut equality: Vec<(&str, &str)> = self
            .tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        if let Some(service) = &self.service {
            equality.push((SERVICE_FIELD, service));
        }
        if let Some(operation) = &self.operation {
            equality.push((OPERATION_FIELD, operation));
        }

        let mut parts = Vec::new();
        let filters = field_filters(equality);
        if !filters.is_empty() {
            parts.push(filters);
        }
        parts.extend(duration_filters(self.duration_min, self.duration_max));
        parts.join(" ")
    }
}
