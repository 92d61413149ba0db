//! Span writer
//!
//! Spans become events grouped by service and are sent by a periodic flush
//! task.

use crate::error::StoreResult;
use crate::traits::SpanWriter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hjs_core::config::IngestSettings;
use hjs_core::Span;
use hjs_humio::query::builder::{DURATION_FIELD, OPERATION_FIELD, PAYLOAD_FIELD, TRACE_ID_FIELD};
use hjs_humio::{BatchIngester, Context, Event, HumioClient, IngestStats, Tags};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Stream tag holding the service name
pub const SERVICE_TAG: &str = "service";

/// Time allowed for the flush on shutdown
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Convert a span to an event
///
/// The span itself goes into `payload`; string, integer and boolean tags of
/// the span and then of its process are copied to attributes unless the name
/// is already taken.
pub fn span_to_event(span: &Span, now: DateTime<Utc>) -> StoreResult<Event> {
    let mut timestamp = span.start_time;
    if timestamp > now {
        warn!(
            trace_id = %span.trace_id,
            ahead_ms = (timestamp - now).num_milliseconds(),
            "Span start time is in the future, using current time"
        );
        timestamp = now;
    }

    let mut payload = serde_json::to_string(span)?;
    payload.push('\n');

    let mut attributes = BTreeMap::new();
    attributes.insert(PAYLOAD_FIELD.to_string(), payload);
    attributes.insert(TRACE_ID_FIELD.to_string(), span.trace_id.to_string());
    attributes.insert(OPERATION_FIELD.to_string(), span.operation_name.clone());
    attributes.insert(
        DURATION_FIELD.to_string(),
        span.duration.as_millis().to_string(),
    );

    for tag in span.tags.iter().chain(&span.process.tags) {
        if let Some(value) = tag.as_filter_string() {
            attributes.entry(tag.key.clone()).or_insert(value);
        }
    }

    Ok(Event::new(timestamp, attributes))
}

/// Stream tags for a span
pub fn span_tags(span: &Span) -> Tags {
    BTreeMap::from([(SERVICE_TAG.to_string(), span.service_name().to_string())])
}

/// Buffers spans and flushes them to Humio
pub struct HumioSpanWriter {
    ingester: BatchIngester,
    flush_interval: Duration,
}

impl HumioSpanWriter {
    pub fn new(client: Arc<HumioClient>, settings: &IngestSettings) -> Self {
        Self {
            ingester: BatchIngester::new(client),
            flush_interval: settings.flush_interval(),
        }
    }

    /// Send buffered spans now
    pub async fn flush(&self, ctx: &Context) -> StoreResult<()> {
        Ok(self.ingester.flush(ctx).await?)
    }

    pub async fn pending_spans(&self) -> usize {
        self.ingester.pending_events().await
    }

    pub fn stats(&self) -> IngestStats {
        self.ingester.stats()
    }

    /// Start the periodic flush task
    ///
    /// The task flushes every `flush_interval` until `shutdown` fires, then
    /// flushes once more.
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_ms = self.flush_interval.as_millis() as u64, "Span flush task started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush(&Context::background()).await {
                            error!(error = %e, "Failed to flush spans");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Span flush task received shutdown");
                        break;
                    }
                }
            }

            let ctx = Context::background().with_timeout(FINAL_FLUSH_TIMEOUT);
            match self.flush(&ctx).await {
                Ok(()) => info!("Span writer stopped"),
                Err(e) => error!(error = %e, "Final span flush failed"),
            }
        })
    }
}

#[async_trait]
impl SpanWriter for HumioSpanWriter {
    async fn write_span(&self, _ctx: &Context, span: &Span) -> StoreResult<()> {
        let event = span_to_event(span, Utc::now())?;
        self.ingester.add_event(span_tags(span), event).await;
        Ok(())
    }
}
