//! Span reader
//!
//! Trace search runs in two phases: find candidate trace ids with the
//! requested filters, then fetch the full sessions of only those traces.

use crate::assembly::{assemble_trace, assemble_traces, decode_spans};
use crate::catalog::Catalog;
use crate::error::{StoreError, StoreResult};
use crate::rows::{CandidateRow, PayloadRow};
use crate::traits::SpanReader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hjs_core::config::{AggregationMode, ReaderSettings};
use hjs_core::{
    Operation, OperationQueryParameters, Span, Trace, TraceId, TraceQueryParameters,
};
use hjs_humio::query::builder::{
    field_filter, group_by_trace_with_bounds, head, pipeline, session_by_trace,
    trace_id_disjunction, TraceFilter, PAYLOAD_FIELD, SESSION_PAUSE, TRACE_ID_FIELD,
};
use hjs_humio::{Context, HumioClient, Query, QueryTime};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Margin kept around the observed span times when narrowing a search
pub const NARROW_SLACK: Duration = Duration::from_secs(2 * 60);

/// Upper bound on spans fetched for client-side aggregation
pub const CLIENT_FETCH_CAP: usize = 10_000;

/// Upper bound on events fetched for one trace
pub const TRACE_EVENT_LIMIT: usize = 1000;

/// Shrink the session window to where candidates were seen
///
/// The result is `[seen_min - slack, seen_max + slack]` clamped to the
/// requested window.
pub fn narrow_window(
    requested: (DateTime<Utc>, DateTime<Utc>),
    seen: (DateTime<Utc>, DateTime<Utc>),
    slack: Duration,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let slack = chrono::Duration::from_std(slack).unwrap_or_else(|_| chrono::Duration::zero());
    let start = (seen.0 - slack).max(requested.0);
    let end = (seen.1 + slack).min(requested.1);
    if start > end {
        requested
    } else {
        (start, end)
    }
}

/// Earliest and latest timestamp over all candidates
fn candidate_bounds(rows: &[CandidateRow]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let min = rows
        .iter()
        .filter_map(|r| r.min.as_ref()?.as_i64())
        .min()?;
    let max = rows
        .iter()
        .filter_map(|r| r.max.as_ref()?.as_i64())
        .max()?;
    Some((
        DateTime::from_timestamp_millis(min)?,
        DateTime::from_timestamp_millis(max)?,
    ))
}

/// Group spans into traces, in order of first appearance
pub fn group_spans(spans: Vec<Span>) -> Vec<Trace> {
    let mut index: HashMap<TraceId, usize> = HashMap::new();
    let mut traces: Vec<Trace> = Vec::new();
    for span in spans {
        let i = *index.entry(span.trace_id).or_insert_with(|| {
            traces.push(Trace::new(span.trace_id));
            traces.len() - 1
        });
        traces[i].spans.push(span);
    }
    traces
}

/// Whether every queried tag is matched by some span of the trace
///
/// Different tags may be matched by different spans.
pub fn trace_matches_tags(trace: &Trace, tags: &BTreeMap<String, String>) -> bool {
    if tags.is_empty() {
        return true;
    }
    let mut found: BTreeSet<&str> = BTreeSet::new();
    for span in &trace.spans {
        for tag in &span.tags {
            if found.contains(tag.key.as_str()) {
                continue;
            }
            let Some(expected) = tags.get(&tag.key) else {
                continue;
            };
            if tag.as_filter_string().as_deref() == Some(expected.as_str()) {
                found.insert(tag.key.as_str());
                if found.len() == tags.len() {
                    return true;
                }
            }
        }
    }
    false
}

/// Reads traces, services and operations from Humio
pub struct HumioSpanReader {
    client: Arc<HumioClient>,
    repository: String,
    settings: ReaderSettings,
    catalog: Catalog,
}

impl HumioSpanReader {
    pub fn new(
        client: Arc<HumioClient>,
        repository: impl Into<String>,
        settings: ReaderSettings,
    ) -> Self {
        let repository = repository.into();
        let catalog = Catalog::new(client.clone(), repository.clone(), settings.catalog_max_age());
        Self {
            client,
            repository,
            settings,
            catalog,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn find_traces_server(
        &self,
        ctx: &Context,
        params: &TraceQueryParameters,
    ) -> StoreResult<Vec<Trace>> {
        let limit = params.limit_or(self.settings.default_num_traces);
        let requested = (params.start_time_min, params.start_time_max);

        let filter = TraceFilter::from_params(params);
        let discovery = Query::new(pipeline(&[
            filter.to_query_string(),
            group_by_trace_with_bounds(limit),
        ]))
        .between(requested.0, requested.1);
        let candidates: Vec<CandidateRow> = self
            .client
            .query_rows(ctx, &self.repository, &discovery)
            .await?;

        let trace_ids: Vec<&str> = candidates.iter().map(|c| c.traceid.as_str()).collect();
        let Some(disjunction) = trace_id_disjunction(&trace_ids) else {
            debug!("No candidate traces");
            return Ok(Vec::new());
        };

        let (start, end) = match self.settings.narrow_window_threshold() {
            Some(threshold) if params.window() > threshold => candidate_bounds(&candidates)
                .map(|seen| narrow_window(requested, seen, NARROW_SLACK))
                .unwrap_or(requested),
            _ => requested,
        };
        debug!(
            candidates = trace_ids.len(),
            start = %start,
            end = %end,
            "Fetching candidate sessions"
        );

        let sessions = Query::new(pipeline(&[disjunction, session_by_trace(SESSION_PAUSE)]))
            .between(start, end);
        let rows: Vec<PayloadRow> = self
            .client
            .query_rows(ctx, &self.repository, &sessions)
            .await?;
        assemble_traces(&rows)
    }

    async fn find_traces_client(
        &self,
        ctx: &Context,
        params: &TraceQueryParameters,
    ) -> StoreResult<Vec<Trace>> {
        let limit = params.limit_or(self.settings.default_num_traces);
        let fetch = limit.saturating_mul(10).min(CLIENT_FETCH_CAP);

        // Tags are matched here, across the spans of each trace
        let filter = TraceFilter {
            tags: BTreeMap::new(),
            ..TraceFilter::from_params(params)
        };
        let selector = format!("{} {}=*", filter.to_query_string(), PAYLOAD_FIELD);
        let query = Query::new(pipeline(&[selector, head(fetch)]))
            .between(params.start_time_min, params.start_time_max);
        let rows: Vec<PayloadRow> = self
            .client
            .query_rows(ctx, &self.repository, &query)
            .await?;

        let mut spans = Vec::with_capacity(rows.len());
        for row in &rows {
            spans.extend(decode_spans(&row.payload)?);
        }

        let mut traces = group_spans(spans);
        traces.retain(|trace| trace_matches_tags(trace, &params.tags));
        traces.truncate(limit);
        Ok(traces)
    }
}

#[async_trait]
impl SpanReader for HumioSpanReader {
    async fn get_trace(&self, ctx: &Context, trace_id: TraceId) -> StoreResult<Option<Trace>> {
        let query = Query::new(pipeline(&[
            field_filter(TRACE_ID_FIELD, &trace_id.to_string()),
            head(TRACE_EVENT_LIMIT),
        ]))
        .with_start(QueryTime::relative(self.settings.trace_lookback.clone()));
        let rows: Vec<PayloadRow> = self
            .client
            .query_rows(ctx, &self.repository, &query)
            .await?;
        assemble_trace(trace_id, &rows)
    }

    async fn get_services(&self, ctx: &Context) -> StoreResult<Vec<String>> {
        self.catalog.services(ctx).await
    }

    async fn get_operations(
        &self,
        ctx: &Context,
        params: &OperationQueryParameters,
    ) -> StoreResult<Vec<Operation>> {
        self.catalog.operations(ctx, params).await
    }

    async fn find_traces(
        &self,
        ctx: &Context,
        params: &TraceQueryParameters,
    ) -> StoreResult<Vec<Trace>> {
        match self.settings.aggregation {
            AggregationMode::Server => self.find_traces_server(ctx, params).await,
            AggregationMode::Client => self.find_traces_client(ctx, params).await,
        }
    }

    async fn find_trace_ids(
        &self,
        _ctx: &Context,
        _params: &TraceQueryParameters,
    ) -> StoreResult<Vec<TraceId>> {
        Err(StoreError::Unsupported("find_trace_ids"))
    }
}
