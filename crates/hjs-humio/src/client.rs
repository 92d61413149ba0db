//! HTTP client for the Humio REST API
//!
//! Handles the synchronous query, query job and structured ingest endpoints.

use crate::clock::{Clock, TokioClock};
use crate::context::Context;
use crate::error::{HumioError, HumioResult};
use crate::ingest::EventStream;
use crate::jobs::{run_query_job, JobPollConfig, QueryJobApi, QueryJobStatus, SubmittedJob};
use crate::query::Query;
use async_trait::async_trait;
use bytes::Bytes;
use hjs_core::config::{HumioSettings, JobSettings};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Authenticated client for one Humio instance
#[derive(Clone)]
pub struct HumioClient {
    client: Client,
    base_url: Url,
    token: String,
    clock: Arc<dyn Clock>,
    jobs: JobPollConfig,
}

impl fmt::Debug for HumioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HumioClient")
            .field("base_url", &self.base_url.as_str())
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl HumioClient {
    /// Create a client; a missing or empty token is a configuration error
    pub fn new(
        settings: &HumioSettings,
        token: Option<&str>,
        jobs: &JobSettings,
    ) -> HumioResult<Self> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HumioError::Config("token not set".to_string()))?;

        let base_url = Url::parse(&settings.url)?;
        if base_url.cannot_be_a_base() {
            return Err(HumioError::Config(format!(
                "invalid base URL: {}",
                settings.url
            )));
        }

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(format!("humio-jaeger-storage/{}", hjs_core::PLUGIN_VERSION))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            clock: Arc::new(TokioClock),
            jobs: JobPollConfig::from(jobs),
        })
    }

    /// Replace the clock used for job polling
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run a query synchronously and return the raw response body
    pub async fn query(&self, ctx: &Context, repository: &str, query: &Query) -> HumioResult<Bytes> {
        let url = self.endpoint(&["api", "v1", "repositories", repository, "query"])?;
        debug!(repository = %repository, query = %query.query_string, "Running query");

        let request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(query);
        self.send(ctx, "query", request).await
    }

    /// Run a query and decode its result rows
    ///
    /// Queries containing a join run as a query job, all others synchronously.
    pub async fn query_rows<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        repository: &str,
        query: &Query,
    ) -> HumioResult<Vec<T>> {
        if query.requires_job() {
            let events =
                run_query_job(self, self.clock.as_ref(), &self.jobs, ctx, repository, query)
                    .await?;
            events
                .into_iter()
                .map(|event| serde_json::from_value(event).map_err(HumioError::from))
                .collect()
        } else {
            let body = self.query(ctx, repository, query).await?;
            Ok(serde_json::from_slice(&body)?)
        }
    }

    /// Send event streams to the structured ingest endpoint
    pub async fn ingest(&self, ctx: &Context, streams: &[EventStream]) -> HumioResult<()> {
        let url = self.endpoint(&["api", "v1", "ingest", "humio-structured"])?;
        let events: usize = streams.iter().map(|s| s.events.len()).sum();
        debug!(streams = streams.len(), events, "Ingesting events");

        let request = self.client.post(url).json(streams);
        self.send(ctx, "ingest", request).await.map(|_| ())
    }

    /// Base URL joined with percent-encoded path segments
    fn endpoint(&self, segments: &[&str]) -> HumioResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| HumioError::Config(format!("invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        ctx: &Context,
        operation: &'static str,
        request: RequestBuilder,
    ) -> HumioResult<Bytes> {
        let request = request.bearer_auth(&self.token);
        ctx.run(async {
            let response = request.send().await?;
            Self::handle_response(operation, response).await
        })
        .await
    }

    /// Map a non-2xx status to an error carrying a body excerpt
    async fn handle_response(
        operation: &'static str,
        response: reqwest::Response,
    ) -> HumioResult<Bytes> {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            Ok(body)
        } else {
            debug!(operation, status = status.as_u16(), "Request rejected");
            Err(HumioError::status(operation, status.as_u16(), &body))
        }
    }
}

#[async_trait]
impl QueryJobApi for HumioClient {
    async fn submit_job(
        &self,
        ctx: &Context,
        repository: &str,
        query: &Query,
    ) -> HumioResult<String> {
        let url = self.endpoint(&["api", "v1", "repositories", repository, "queryjobs"])?;
        debug!(repository = %repository, query = %query.query_string, "Submitting query job");

        let request = self.client.post(url).json(query);
        let body = self.send(ctx, "submit query job", request).await?;
        let job: SubmittedJob = serde_json::from_slice(&body)?;
        Ok(job.id)
    }

    async fn poll_job(
        &self,
        ctx: &Context,
        repository: &str,
        job_id: &str,
    ) -> HumioResult<QueryJobStatus> {
        let url = self.endpoint(&["api", "v1", "repositories", repository, "queryjobs", job_id])?;
        let body = self.send(ctx, "poll query job", self.client.get(url)).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn delete_job(&self, ctx: &Context, repository: &str, job_id: &str) -> HumioResult<()> {
        let url = self.endpoint(&["api", "v1", "repositories", repository, "queryjobs", job_id])?;
        self.send(ctx, "delete query job", self.client.delete(url))
            .await
            .map(|_| ())
    }
}
