//! HJS Humio - Search client for the Humio REST API
//!
//! - **Query**: query model and the query language builder
//! - **Client**: synchronous queries, structured ingest, bearer auth
//! - **Jobs**: asynchronous query jobs with deadline-bounded polling
//! - **Ingest**: in-memory event streams flushed as one batch

pub mod client;
pub mod clock;
pub mod context;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod query;

pub use client::HumioClient;
pub use clock::{Clock, TokioClock};
pub use context::{CancelHandle, Context};
pub use error::{HumioError, HumioResult};
pub use ingest::{BatchIngester, Event, EventStream, IngestStats, Tags};
pub use jobs::{JobPollConfig, QueryJobApi, QueryJobStatus};
pub use query::{Query, QueryTime};
