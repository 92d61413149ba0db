//! Service dependency graph
//!
//! A background task rebuilds the graph from a join of every span with its
//! parent span, one query job per time bucket, and swaps in the result.

use crate::error::{StoreError, StoreResult};
use crate::rows::DependencyRow;
use crate::traits::DependencyReader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hjs_core::config::DependencySettings;
use hjs_core::DependencyLink;
use hjs_humio::{Context, HumioClient, Query};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Source recorded on every link
pub const DEPENDENCY_SOURCE: &str = "humio";

/// Pairs each span's service (child) with its parent span's service
pub const DEPENDENCY_QUERY: &str = "parseJson(payload) | child:=process.service_name | parent_span_id := references[0].span_id\n\
| join({parseJson(payload) | parent := process.service_name }, key=[span_id], field=[parent_span_id], include=[parent]) | groupBy([parent,child])";

/// Consecutive `[start, end)` buckets covering `window` up to `end`
pub fn bucket_windows(
    end: DateTime<Utc>,
    window: Duration,
    bucket: Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let (Ok(window), Ok(bucket)) = (
        chrono::Duration::from_std(window),
        chrono::Duration::from_std(bucket),
    ) else {
        return Vec::new();
    };
    if bucket <= chrono::Duration::zero() {
        return Vec::new();
    }

    let mut buckets = Vec::new();
    let mut start = end - window;
    while start < end {
        let bucket_end = (start + bucket).min(end);
        buckets.push((start, bucket_end));
        start = bucket_end;
    }
    buckets
}

/// Call counts keyed by (child, parent)
#[derive(Debug, Default)]
pub struct DependencyAccumulator {
    counts: BTreeMap<(String, String), u64>,
}

impl DependencyAccumulator {
    /// Add one row; self calls are ignored before their count is read
    pub fn add(&mut self, row: DependencyRow) -> StoreResult<()> {
        if row.child == row.parent || row.child.is_empty() || row.parent.is_empty() {
            return Ok(());
        }
        let count = row
            .count
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| StoreError::InvalidCount(row.count.raw()))?;
        *self.counts.entry((row.child, row.parent)).or_default() += count;
        Ok(())
    }

    pub fn into_links(self) -> Vec<DependencyLink> {
        self.counts
            .into_iter()
            .map(|((child, parent), call_count)| DependencyLink {
                parent,
                child,
                call_count,
                source: DEPENDENCY_SOURCE.to_string(),
            })
            .collect()
    }
}

/// Periodically rebuilt dependency links
pub struct DependencyCache {
    client: Arc<HumioClient>,
    repository: String,
    settings: DependencySettings,
    links: RwLock<Arc<Vec<DependencyLink>>>,
}

impl DependencyCache {
    pub fn new(
        client: Arc<HumioClient>,
        repository: impl Into<String>,
        settings: DependencySettings,
    ) -> Self {
        Self {
            client,
            repository: repository.into(),
            settings,
            links: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Current snapshot
    pub fn links(&self) -> Arc<Vec<DependencyLink>> {
        self.links.read().clone()
    }

    /// Rebuild the graph over the configured window ending now
    ///
    /// On error the previous snapshot stays in place.
    pub async fn refresh(&self, ctx: &Context) -> StoreResult<()> {
        let buckets = bucket_windows(Utc::now(), self.settings.window(), self.settings.bucket());
        let mut accumulator = DependencyAccumulator::default();

        for (start, end) in &buckets {
            let query = Query::new(DEPENDENCY_QUERY).between(*start, *end);
            let rows: Vec<DependencyRow> = self
                .client
                .query_rows(ctx, &self.repository, &query)
                .await?;
            debug!(start = %start, rows = rows.len(), "Dependency bucket done");
            for row in rows {
                accumulator.add(row)?;
            }
        }

        let links = accumulator.into_links();
        info!(
            links = links.len(),
            buckets = buckets.len(),
            "Dependencies refreshed"
        );
        *self.links.write() = Arc::new(links);
        Ok(())
    }

    /// Start the refresh task: once now, then every refresh interval
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.refresh_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let ctx = Context::background();
                        tokio::select! {
                            result = self.refresh(&ctx) => {
                                if let Err(e) = result {
                                    error!(error = %e, "Failed to refresh dependencies");
                                }
                            }
                            _ = shutdown.recv() => break,
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Dependency refresh task stopped");
        })
    }
}

#[async_trait]
impl DependencyReader for DependencyCache {
    /// The snapshot always covers the configured window; the requested
    /// range is not applied
    async fn get_dependencies(
        &self,
        _ctx: &Context,
        _end_ts: DateTime<Utc>,
        _lookback: Duration,
    ) -> StoreResult<Vec<DependencyLink>> {
        Ok(self.links().as_ref().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Numeric;
    use hjs_core::config::{HumioSettings, JobSettings};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const JOBS_PATH: &str = "/api/v1/repositories/traces/queryjobs";

    fn row(child: &str, parent: &str, count: &str) -> DependencyRow {
        DependencyRow {
            parent: parent.to_string(),
            child: child.to_string(),
            count: Numeric::Text(count.to_string()),
        }
    }

    fn cache(server: &MockServer) -> DependencyCache {
        let settings = HumioSettings {
            url: server.uri(),
            ..Default::default()
        };
        let client = HumioClient::new(&settings, Some("r"), &JobSettings::default()).unwrap();
        DependencyCache::new(
            Arc::new(client),
            "traces",
            DependencySettings {
                enabled: true,
                refresh_interval_secs: 3600,
                window_hours: 1,
                bucket_minutes: 30,
            },
        )
    }

    async fn mount_job(server: &MockServer, events: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path(JOBS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "dep"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{JOBS_PATH}/dep")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"done": true, "events": events})),
            )
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{JOBS_PATH}/dep")))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    #[test]
    fn test_day_splits_into_96_buckets() {
        let end = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let buckets = bucket_windows(
            end,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(15 * 60),
        );
        assert_eq!(buckets.len(), 96);
        assert_eq!(buckets[0].0, end - chrono::Duration::hours(24));
        assert_eq!(buckets[95].1, end);
        assert!(buckets.windows(2).all(|w| w[0].1 == w[1].0));
    }

    #[test]
    fn test_partial_last_bucket() {
        let end = DateTime::from_timestamp(10_000, 0).unwrap();
        let buckets = bucket_windows(end, Duration::from_secs(100), Duration::from_secs(30));
        assert_eq!(buckets.len(), 4);
        assert_eq!(buckets[3].1 - buckets[3].0, chrono::Duration::seconds(10));
        assert!(bucket_windows(end, Duration::from_secs(100), Duration::ZERO).is_empty());
    }

    #[test]
    fn test_accumulates_across_buckets() {
        let mut acc = DependencyAccumulator::default();
        acc.add(row("X", "Y", "3")).unwrap();
        acc.add(row("X", "Y", "5")).unwrap();
        acc.add(row("X", "X", "100")).unwrap();

        let links = acc.into_links();
        assert_eq!(
            links,
            vec![DependencyLink {
                parent: "Y".to_string(),
                child: "X".to_string(),
                call_count: 8,
                source: "humio".to_string(),
            }]
        );
    }

    #[test]
    fn test_unparsable_count() {
        let mut acc = DependencyAccumulator::default();
        let err = acc.add(row("X", "Y", "lots")).unwrap_err();
        assert_eq!(err.to_string(), "Unparsable _count \"lots\"");
        assert!(acc.add(row("X", "Y", "-1")).is_err());
    }

    #[test]
    fn test_self_pair_skipped_before_count() {
        let mut acc = DependencyAccumulator::default();
        acc.add(row("X", "X", "n/a")).unwrap();
        acc.add(row("", "Y", "n/a")).unwrap();
        assert!(acc.into_links().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_ignores_self_pair_with_bad_count() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            json!([
                {"parent": "api", "child": "api", "_count": "n/a"},
                {"parent": "api", "child": "db", "_count": "2"}
            ]),
        )
        .await;

        let cache = cache(&server);
        cache.refresh(&Context::background()).await.unwrap();
        let links = cache.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].child, "db");
    }

    #[test]
    fn test_join_query_text() {
        assert!(DEPENDENCY_QUERY.starts_with("parseJson(payload) | child:=process.service_name"));
        assert!(DEPENDENCY_QUERY.contains("\n| join({parseJson(payload)"));
        assert!(DEPENDENCY_QUERY.ends_with("| groupBy([parent,child])"));
        assert!(Query::new(DEPENDENCY_QUERY).requires_job());
    }

    #[tokio::test]
    async fn test_refresh_runs_one_job_per_bucket() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            json!([
                {"parent": "frontend", "child": "backend", "_count": "3"},
                {"parent": "backend", "child": "backend", "_count": "9"}
            ]),
        )
        .await;

        let cache = cache(&server);
        cache.refresh(&Context::background()).await.unwrap();

        let links = cache
            .get_dependencies(&Context::background(), Utc::now(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].parent, "frontend");
        assert_eq!(links[0].child, "backend");
        // Two 30 minute buckets, three each
        assert_eq!(links[0].call_count, 6);

        let submits = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "POST")
            .count();
        assert_eq!(submits, 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            json!([{"parent": "a", "child": "b", "_count": "1"}]),
        )
        .await;

        let cache = cache(&server);
        cache.refresh(&Context::background()).await.unwrap();
        assert_eq!(cache.links().len(), 1);

        server.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        assert!(cache.refresh(&Context::background()).await.is_err());
        assert_eq!(cache.links().len(), 1);
    }

    #[tokio::test]
    async fn test_background_task_refreshes_and_stops() {
        let server = MockServer::start().await;
        mount_job(
            &server,
            json!([{"parent": "a", "child": "b", "_count": 2}]),
        )
        .await;

        let cache = Arc::new(cache(&server));
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = cache.clone().start(shutdown_tx.subscribe());

        let mut waited = 0;
        while cache.links().is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert_eq!(cache.links()[0].call_count, 4);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
