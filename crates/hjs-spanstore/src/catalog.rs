//! Service and operation catalog
//!
//! Refreshed inline by the first reader that finds it stale. Each refresh
//! only asks for what arrived since the previous one and merges it in, so
//! the catalog never shrinks.

use crate::error::StoreResult;
use crate::rows::CatalogRow;
use chrono::{DateTime, Utc};
use hjs_core::{Operation, OperationQueryParameters};
use hjs_humio::query::builder::group_by_service_operation;
use hjs_humio::{Context, HumioClient, Query, QueryTime};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Window of the first refresh
pub const INITIAL_LOOKBACK: &str = "1 day";

/// Span kind reported for every operation
pub const DEFAULT_SPAN_KIND: &str = "server";

/// Service name to operation names
pub type CatalogSnapshot = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Default)]
struct CatalogState {
    snapshot: Arc<CatalogSnapshot>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl CatalogState {
    fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.refreshed_at {
            Some(at) => (now - at).to_std().map(|age| age < max_age).unwrap_or(true),
            None => false,
        }
    }
}

/// Union of `prior` and the services and operations in `rows`
pub fn merge_catalog<I>(prior: &CatalogSnapshot, rows: I) -> CatalogSnapshot
where
    I: IntoIterator<Item = CatalogRow>,
{
    let mut merged = prior.clone();
    for row in rows {
        if row.service.is_empty() {
            continue;
        }
        let operations = merged.entry(row.service).or_default();
        if let Some(operation) = row.operation.filter(|op| !op.is_empty()) {
            operations.insert(operation);
        }
    }
    merged
}

/// Cached service/operation catalog
pub struct Catalog {
    client: Arc<HumioClient>,
    repository: String,
    max_age: Duration,
    state: RwLock<CatalogState>,
}

impl Catalog {
    pub fn new(client: Arc<HumioClient>, repository: impl Into<String>, max_age: Duration) -> Self {
        Self {
            client,
            repository: repository.into(),
            max_age,
            state: RwLock::new(CatalogState::default()),
        }
    }

    /// Current catalog, refreshed first if older than `max_age`
    pub async fn snapshot(&self, ctx: &Context) -> StoreResult<Arc<CatalogSnapshot>> {
        {
            let state = self.state.read().await;
            if state.is_fresh(Utc::now(), self.max_age) {
                return Ok(state.snapshot.clone());
            }
        }

        let mut state = self.state.write().await;
        // Another reader may have refreshed while we waited
        if state.is_fresh(Utc::now(), self.max_age) {
            return Ok(state.snapshot.clone());
        }
        self.refresh_locked(ctx, &mut state).await
    }

    async fn refresh_locked(
        &self,
        ctx: &Context,
        state: &mut CatalogState,
    ) -> StoreResult<Arc<CatalogSnapshot>> {
        let started = Utc::now();
        let start = match state.refreshed_at {
            Some(at) => QueryTime::Absolute(at),
            None => QueryTime::relative(INITIAL_LOOKBACK),
        };
        let query = Query::new(group_by_service_operation()).with_start(start);
        let rows: Vec<CatalogRow> = self
            .client
            .query_rows(ctx, &self.repository, &query)
            .await?;

        let merged = merge_catalog(&state.snapshot, rows);
        debug!(services = merged.len(), "Catalog refreshed");
        state.snapshot = Arc::new(merged);
        state.refreshed_at = Some(started);
        Ok(state.snapshot.clone())
    }

    /// Known services, sorted
    pub async fn services(&self, ctx: &Context) -> StoreResult<Vec<String>> {
        let snapshot = self.snapshot(ctx).await?;
        Ok(snapshot.keys().cloned().collect())
    }

    /// Known operations, optionally of one service, sorted by name
    pub async fn operations(
        &self,
        ctx: &Context,
        params: &OperationQueryParameters,
    ) -> StoreResult<Vec<Operation>> {
        let span_kind = params.span_kind.as_deref().filter(|k| !k.is_empty());
        if span_kind.is_some_and(|k| k != DEFAULT_SPAN_KIND) {
            return Ok(Vec::new());
        }

        let snapshot = self.snapshot(ctx).await?;
        let names: BTreeSet<&String> = match params.service_name.as_deref() {
            Some(service) if !service.is_empty() => {
                snapshot.get(service).into_iter().flatten().collect()
            }
            _ => snapshot.values().flatten().collect(),
        };

        Ok(names
            .into_iter()
            .map(|name| Operation {
                name: name.clone(),
                span_kind: DEFAULT_SPAN_KIND.to_string(),
            })
            .collect())
    }
}
