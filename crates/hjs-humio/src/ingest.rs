//! Batched structured ingest
//!
//! Events are grouped by their stream tags in memory and sent as one batch
//! per flush.

use crate::client::HumioClient;
use crate::context::Context;
use crate::error::HumioResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Attribute set identifying an event stream
pub type Tags = BTreeMap<String, String>;

/// One ingested event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, attributes: BTreeMap<String, String>) -> Self {
        Self {
            timestamp,
            attributes,
        }
    }
}

/// Events sharing one tag set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream {
    pub tags: Tags,
    pub events: Vec<Event>,
}

/// Ingest statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub batches_sent: u64,
    pub failed_flushes: u64,
}

/// In-memory buffer of event streams flushed to the ingest endpoint
pub struct BatchIngester {
    client: Arc<HumioClient>,
    buffer: Mutex<Vec<EventStream>>,

    // Stats
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    batches_sent: AtomicU64,
    failed_flushes: AtomicU64,
}

impl BatchIngester {
    pub fn new(client: Arc<HumioClient>) -> Self {
        Self {
            client,
            buffer: Mutex::new(Vec::new()),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }

    /// Append `event` to the stream tagged `tags`, creating it if needed
    pub async fn add_event(&self, tags: Tags, event: Event) {
        let mut buffer = self.buffer.lock().await;
        match buffer.iter_mut().find(|stream| stream.tags == tags) {
            Some(stream) => stream.events.push(event),
            None => buffer.push(EventStream {
                tags,
                events: vec![event],
            }),
        }
    }

    /// Send everything buffered as one batch
    ///
    /// A 4xx response drops the batch; a 5xx response or transport failure
    /// keeps it for the next flush. Either way the error is returned.
    pub async fn flush(&self, ctx: &Context) -> HumioResult<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(());
        }

        let count: usize = buffer.iter().map(|s| s.events.len()).sum();
        match self.client.ingest(ctx, &buffer).await {
            Ok(()) => {
                debug!(streams = buffer.len(), events = count, "Flushed events");
                buffer.clear();
                self.events_sent.fetch_add(count as u64, Ordering::Relaxed);
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_client_error() => {
                warn!(events = count, error = %e, "Ingest rejected, dropping events");
                buffer.clear();
                self.events_dropped.fetch_add(count as u64, Ordering::Relaxed);
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(e) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Number of buffered events
    pub async fn pending_events(&self) -> usize {
        self.buffer
            .lock()
            .await
            .iter()
            .map(|s| s.events.len())
            .sum()
    }

    /// Copy of the buffered streams
    pub async fn snapshot(&self) -> Vec<EventStream> {
        self.buffer.lock().await.clone()
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HumioError;
    use hjs_core::config::{HumioSettings, JobSettings};
    use serde_json::Value;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ingester(url: String) -> BatchIngester {
        let settings = HumioSettings {
            url,
            ..Default::default()
        };
        let client = HumioClient::new(&settings, Some("ingest-token"), &JobSettings::default())
            .unwrap();
        BatchIngester::new(Arc::new(client))
    }

    fn tags(service: &str) -> Tags {
        BTreeMap::from([("service".to_string(), service.to_string())])
    }

    fn event(n: i64) -> Event {
        Event::new(
            DateTime::from_timestamp_millis(n).unwrap(),
            BTreeMap::from([("n".to_string(), n.to_string())]),
        )
    }

    #[tokio::test]
    async fn test_equal_tags_share_a_stream() {
        let ingester = ingester("http://127.0.0.1:1".to_string());
        ingester.add_event(tags("a"), event(1)).await;
        ingester.add_event(tags("a"), event(2)).await;
        ingester.add_event(tags("b"), event(3)).await;

        let streams = ingester.snapshot().await;
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].tags, tags("a"));
        assert_eq!(streams[0].events, vec![event(1), event(2)]);
        assert_eq!(streams[1].events, vec![event(3)]);
    }

    #[tokio::test]
    async fn test_empty_flush_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ingester = ingester(server.uri());
        ingester.flush(&Context::background()).await.unwrap();
        assert_eq!(ingester.stats(), IngestStats::default());
    }

    #[tokio::test]
    async fn test_successful_flush_clears_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/ingest/humio-structured"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let ingester = ingester(server.uri());
        for n in 0..100 {
            ingester.add_event(tags("svc"), event(n)).await;
        }
        ingester.flush(&Context::background()).await.unwrap();

        assert_eq!(ingester.pending_events().await, 0);
        let stats = ingester.stats();
        assert_eq!(stats.events_sent, 100);
        assert_eq!(stats.batches_sent, 1);

        let requests = server.received_requests().await.unwrap();
        let batch: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(batch.as_array().unwrap().len(), 1);
        assert_eq!(batch[0]["events"].as_array().unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_client_error_drops_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("malformed"))
            .mount(&server)
            .await;

        let ingester = ingester(server.uri());
        ingester.add_event(tags("svc"), event(1)).await;
        let err = ingester.flush(&Context::background()).await.unwrap_err();

        assert_eq!(err.status_code(), Some(400));
        assert_eq!(ingester.pending_events().await, 0);
        assert_eq!(ingester.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_server_error_retains_buffer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ingester = ingester(server.uri());
        ingester.add_event(tags("a"), event(1)).await;
        ingester.add_event(tags("b"), event(2)).await;
        let before = ingester.snapshot().await;

        let err = ingester.flush(&Context::background()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ingester.snapshot().await, before);

        ingester.flush(&Context::background()).await.unwrap();
        assert_eq!(ingester.pending_events().await, 0);
        assert_eq!(ingester.stats().failed_flushes, 1);
    }

    #[tokio::test]
    async fn test_transport_error_retains_buffer() {
        // Nothing listens on port 1
        let ingester = ingester("http://127.0.0.1:1".to_string());
        ingester.add_event(tags("svc"), event(1)).await;

        let err = ingester.flush(&Context::background()).await.unwrap_err();
        assert!(matches!(err, HumioError::Network(_)));
        assert_eq!(ingester.pending_events().await, 1);
    }
}
