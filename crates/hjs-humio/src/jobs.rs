//! Asynchronous query jobs
//!
//! A job is submitted, polled until it reports `done` or the deadline passes,
//! and then deleted. The polling decision is a small state machine driven by
//! an injected [`Clock`] so deadlines can be tested without real time.

use crate::clock::Clock;
use crate::context::Context;
use crate::error::{HumioError, HumioResult};
use crate::query::Query;
use async_trait::async_trait;
use hjs_core::config::JobSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Time budget for the best-effort job deletion
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress metadata of a running job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryJobMetadata {
    /// Server hint for the next poll, in milliseconds
    pub poll_after: Option<u64>,
    pub processed_bytes: u64,
    pub processed_events: u64,
    pub total_work: u64,
    pub work_done: u64,
}

/// Response of a job poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryJobStatus {
    pub done: bool,
    pub events: Vec<Value>,
    pub meta_data: QueryJobMetadata,
}

/// Response of a job submission
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedJob {
    pub id: String,
}

/// The three job endpoints
#[async_trait]
pub trait QueryJobApi: Send + Sync {
    async fn submit_job(&self, ctx: &Context, repository: &str, query: &Query)
        -> HumioResult<String>;

    async fn poll_job(
        &self,
        ctx: &Context,
        repository: &str,
        job_id: &str,
    ) -> HumioResult<QueryJobStatus>;

    async fn delete_job(&self, ctx: &Context, repository: &str, job_id: &str) -> HumioResult<()>;
}

/// Polling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPollConfig {
    /// Floor applied to the server's poll hint
    pub min_poll_interval: Duration,
    /// Sleep used when the server sends no hint
    pub default_poll_interval: Duration,
    /// Polling budget when the caller has no deadline
    pub default_timeout: Duration,
    /// Reserved before the caller's deadline to return a result in time
    pub deadline_margin: Duration,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self::from(&JobSettings::default())
    }
}

impl From<&JobSettings> for JobPollConfig {
    fn from(settings: &JobSettings) -> Self {
        Self {
            min_poll_interval: Duration::from_millis(settings.min_poll_interval_ms),
            default_poll_interval: Duration::from_millis(settings.default_poll_interval_ms),
            default_timeout: Duration::from_secs(settings.default_timeout_secs),
            deadline_margin: Duration::from_secs(1),
        }
    }
}

impl JobPollConfig {
    /// Polling deadline: the caller's deadline less the margin, or the
    /// default timeout from `now`
    pub fn deadline(&self, caller_deadline: Option<Instant>, now: Instant) -> Instant {
        match caller_deadline {
            Some(deadline) => deadline.checked_sub(self.deadline_margin).unwrap_or(now),
            None => now + self.default_timeout,
        }
    }

    fn poll_interval(&self, poll_after: Option<u64>) -> Duration {
        poll_after
            .map(Duration::from_millis)
            .unwrap_or(self.default_poll_interval)
            .max(self.min_poll_interval)
    }
}

/// What to do after a poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    Sleep(Duration),
    Done(Vec<Value>),
    Expired,
}

/// Polling state of one job
#[derive(Debug)]
pub struct JobPoller {
    config: JobPollConfig,
    deadline: Instant,
    partial: Option<Vec<Value>>,
}

impl JobPoller {
    pub fn new(config: JobPollConfig, deadline: Instant) -> Self {
        Self {
            config,
            deadline,
            partial: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Feed one poll response observed at `now`
    pub fn step(&mut self, status: QueryJobStatus, now: Instant) -> PollStep {
        if status.done {
            return PollStep::Done(status.events);
        }
        if !status.events.is_empty() {
            self.partial = Some(status.events);
        }
        if now >= self.deadline {
            return PollStep::Expired;
        }
        let wait = self.config.poll_interval(status.meta_data.poll_after);
        PollStep::Sleep(wait.min(self.deadline - now))
    }

    /// Result after expiry: the last non-empty partial result, if any
    pub fn into_partial(self, job_id: &str) -> HumioResult<Vec<Value>> {
        self.partial.ok_or_else(|| HumioError::JobTimeout {
            job_id: job_id.to_string(),
        })
    }
}

/// Run `query` as a job and return its events
///
/// The job is deleted exactly once after a successful submit, whatever the
/// outcome of polling.
pub async fn run_query_job(
    api: &dyn QueryJobApi,
    clock: &dyn Clock,
    config: &JobPollConfig,
    ctx: &Context,
    repository: &str,
    query: &Query,
) -> HumioResult<Vec<Value>> {
    let deadline = config.deadline(ctx.deadline(), clock.now());
    let job_id = api.submit_job(ctx, repository, query).await?;
    debug!(job_id = %job_id, repository = %repository, "Submitted query job");

    let poller = JobPoller::new(*config, deadline);
    let result = poll_job(api, clock, ctx, repository, &job_id, poller).await;

    let delete_ctx = Context::background().with_timeout(DELETE_TIMEOUT);
    if let Err(e) = api.delete_job(&delete_ctx, repository, &job_id).await {
        warn!(job_id = %job_id, error = %e, "Failed to delete query job");
    }

    result
}

async fn poll_job(
    api: &dyn QueryJobApi,
    clock: &dyn Clock,
    ctx: &Context,
    repository: &str,
    job_id: &str,
    mut poller: JobPoller,
) -> HumioResult<Vec<Value>> {
    // A poll in flight at the deadline must not outlive it
    let poll_ctx = ctx.clone().with_deadline(poller.deadline());
    loop {
        if let Some(cause) = ctx.cancel_cause() {
            return Err(HumioError::Cancelled(cause));
        }

        let status = match api.poll_job(&poll_ctx, repository, job_id).await {
            Ok(status) => status,
            Err(HumioError::DeadlineExceeded) => {
                debug!(job_id = %job_id, "Query job poll cut off by deadline");
                return poller.into_partial(job_id);
            }
            Err(e) => return Err(e),
        };
        match poller.step(status, clock.now()) {
            PollStep::Done(events) => {
                debug!(job_id = %job_id, events = events.len(), "Query job done");
                return Ok(events);
            }
            PollStep::Expired => {
                debug!(job_id = %job_id, "Query job deadline reached");
                return poller.into_partial(job_id);
            }
            PollStep::Sleep(wait) => {
                tokio::select! {
                    biased;
                    cause = ctx.cancelled() => return Err(HumioError::Cancelled(cause)),
                    _ = clock.sleep(wait) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelHandle;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeClock {
        now: Mutex<Instant>,
        sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
                sleeps: Mutex::new(Vec::new()),
            }
        }

        fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    /// Replays scripted poll responses, repeating the last one
    struct FakeJobApi {
        responses: Mutex<VecDeque<QueryJobStatus>>,
        polls: AtomicUsize,
        deletes: AtomicUsize,
        cancel_on_poll: Mutex<Option<(usize, CancelHandle)>>,
        fail_delete: bool,
    }

    impl FakeJobApi {
        fn new(responses: Vec<QueryJobStatus>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                polls: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                cancel_on_poll: Mutex::new(None),
                fail_delete: false,
            }
        }
    }

    #[async_trait]
    impl QueryJobApi for FakeJobApi {
        async fn submit_job(&self, _: &Context, _: &str, _: &Query) -> HumioResult<String> {
            Ok("job-1".to_string())
        }

        async fn poll_job(&self, _: &Context, _: &str, job_id: &str) -> HumioResult<QueryJobStatus> {
            assert_eq!(job_id, "job-1");
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((at, handle)) = &*self.cancel_on_poll.lock().unwrap() {
                if *at == polls {
                    handle.cancel("client went away");
                }
            }
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop_front().unwrap_or_default())
            } else {
                Ok(responses.front().cloned().unwrap_or_default())
            }
        }

        async fn delete_job(&self, _: &Context, _: &str, _: &str) -> HumioResult<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                Err(HumioError::status("delete query job", 500, b"boom"))
            } else {
                Ok(())
            }
        }
    }

    fn pending(poll_after: Option<u64>, events: Vec<Value>) -> QueryJobStatus {
        QueryJobStatus {
            done: false,
            events,
            meta_data: QueryJobMetadata {
                poll_after,
                ..Default::default()
            },
        }
    }

    fn done(events: Vec<Value>) -> QueryJobStatus {
        QueryJobStatus {
            done: true,
            events,
            meta_data: QueryJobMetadata::default(),
        }
    }

    #[test]
    fn test_status_deserializes_from_wire() {
        let status: QueryJobStatus = serde_json::from_value(json!({
            "done": false,
            "events": [{"traceid": "abc"}],
            "metaData": {
                "pollAfter": 250,
                "processedBytes": 10,
                "processedEvents": 2,
                "totalWork": 8,
                "workDone": 4
            }
        }))
        .unwrap();
        assert!(!status.done);
        assert_eq!(status.events.len(), 1);
        assert_eq!(status.meta_data.poll_after, Some(250));
        assert_eq!(status.meta_data.work_done, 4);

        let status: QueryJobStatus = serde_json::from_value(json!({"done": true})).unwrap();
        assert!(status.events.is_empty());
        assert_eq!(status.meta_data.poll_after, None);
    }

    #[test]
    fn test_deadline_from_caller() {
        let config = JobPollConfig::default();
        let now = Instant::now();

        let deadline = config.deadline(Some(now + Duration::from_secs(10)), now);
        assert_eq!(deadline, now + Duration::from_secs(9));

        assert_eq!(config.deadline(None, now), now + Duration::from_secs(15));
    }

    #[test]
    fn test_step_floors_and_defaults_poll_interval() {
        let now = Instant::now();
        let mut poller = JobPoller::new(JobPollConfig::default(), now + Duration::from_secs(15));

        assert_eq!(
            poller.step(pending(Some(5), vec![]), now),
            PollStep::Sleep(Duration::from_millis(10))
        );
        assert_eq!(
            poller.step(pending(None, vec![]), now),
            PollStep::Sleep(Duration::from_millis(1000))
        );
        assert_eq!(
            poller.step(pending(Some(300), vec![]), now),
            PollStep::Sleep(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_step_never_sleeps_past_deadline() {
        let now = Instant::now();
        let mut poller = JobPoller::new(JobPollConfig::default(), now + Duration::from_millis(200));
        assert_eq!(
            poller.step(pending(Some(1000), vec![]), now),
            PollStep::Sleep(Duration::from_millis(200))
        );
    }

    #[tokio::test]
    async fn test_polls_until_done() {
        let api = FakeJobApi::new(vec![
            pending(Some(5), vec![]),
            pending(Some(5), vec![]),
            done(vec![json!({"a": 1}), json!({"a": 2})]),
        ]);
        let clock = FakeClock::new();
        let config = JobPollConfig {
            min_poll_interval: Duration::from_millis(1),
            ..Default::default()
        };

        let events = run_query_job(
            &api,
            &clock,
            &config,
            &Context::background(),
            "repo",
            &Query::new("x"),
        )
        .await
        .unwrap();

        assert_eq!(events, vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(5); 2]);
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_floor_applies_to_short_hints() {
        let api = FakeJobApi::new(vec![pending(Some(5), vec![]), done(vec![])]);
        let clock = FakeClock::new();

        run_query_job(
            &api,
            &clock,
            &JobPollConfig::default(),
            &Context::background(),
            "repo",
            &Query::new("x"),
        )
        .await
        .unwrap();

        assert_eq!(clock.sleeps(), vec![Duration::from_millis(10)]);
    }

    #[tokio::test]
    async fn test_expiry_returns_last_partial() {
        let api = FakeJobApi::new(vec![
            pending(Some(1000), vec![json!({"partial": 1})]),
            pending(Some(1000), vec![]),
        ]);
        let clock = FakeClock::new();
        let ctx = Context::background().with_deadline(clock.now() + Duration::from_secs(2));

        let events = run_query_job(
            &api,
            &clock,
            &JobPollConfig::default(),
            &ctx,
            "repo",
            &Query::new("x"),
        )
        .await
        .unwrap();

        assert_eq!(events, vec![json!({"partial": 1})]);
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_without_partial_is_timeout() {
        let mut api = FakeJobApi::new(vec![pending(Some(1000), vec![])]);
        api.fail_delete = true;
        let clock = FakeClock::new();

        let result = run_query_job(
            &api,
            &clock,
            &JobPollConfig::default(),
            &Context::background(),
            "repo",
            &Query::new("x"),
        )
        .await;

        match result {
            Err(HumioError::JobTimeout { job_id }) => assert_eq!(job_id, "job-1"),
            other => panic!("unexpected result: {other:?}"),
        }
        let slept: Duration = clock.sleeps().iter().sum();
        assert_eq!(slept, Duration::from_secs(15));
        // Deletion failure is logged, not returned
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling_and_deletes() {
        let api = FakeJobApi::new(vec![pending(Some(1000), vec![])]);
        let (ctx, handle) = Context::background().with_cancel();
        *api.cancel_on_poll.lock().unwrap() = Some((2, handle));
        let clock = FakeClock::new();

        let result = run_query_job(
            &api,
            &clock,
            &JobPollConfig::default(),
            &ctx,
            "repo",
            &Query::new("x"),
        )
        .await;

        match result {
            Err(HumioError::Cancelled(cause)) => assert_eq!(cause, "client went away"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(api.polls.load(Ordering::SeqCst), 2);
        assert_eq!(clock.sleeps().len(), 1);
        assert_eq!(api.deletes.load(Ordering::SeqCst), 1);
    }
}
