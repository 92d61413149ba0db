//! Storage interfaces exposed to the host
//!
//! The host transport calls into these; everything behind them is Humio
//! specific.

use crate::error::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hjs_core::{
    DependencyLink, Operation, OperationQueryParameters, Span, Trace, TraceId,
    TraceQueryParameters,
};
use hjs_humio::Context;
use std::time::Duration;

/// Write path
#[async_trait]
pub trait SpanWriter: Send + Sync {
    /// Buffer one span for the next flush
    async fn write_span(&self, ctx: &Context, span: &Span) -> StoreResult<()>;
}

/// Read path
#[async_trait]
pub trait SpanReader: Send + Sync {
    /// Look up a trace; `None` if no span of it is stored
    async fn get_trace(&self, ctx: &Context, trace_id: TraceId) -> StoreResult<Option<Trace>>;

    async fn get_services(&self, ctx: &Context) -> StoreResult<Vec<String>>;

    async fn get_operations(
        &self,
        ctx: &Context,
        params: &OperationQueryParameters,
    ) -> StoreResult<Vec<Operation>>;

    async fn find_traces(
        &self,
        ctx: &Context,
        params: &TraceQueryParameters,
    ) -> StoreResult<Vec<Trace>>;

    async fn find_trace_ids(
        &self,
        ctx: &Context,
        params: &TraceQueryParameters,
    ) -> StoreResult<Vec<TraceId>>;
}

/// Service dependency graph
#[async_trait]
pub trait DependencyReader: Send + Sync {
    async fn get_dependencies(
        &self,
        ctx: &Context,
        end_ts: DateTime<Utc>,
        lookback: Duration,
    ) -> StoreResult<Vec<DependencyLink>>;
}
