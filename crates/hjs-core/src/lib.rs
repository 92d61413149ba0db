//! HJS Core - Span model, reader parameters and configuration
//!
//! This crate provides the types shared by every part of the storage plugin:
//!
//! - **Trace**: spans, traces, ids and tags as stored in the event payload
//! - **Query**: parameters and results of the reader operations
//! - **Config**: file + environment configuration

pub mod config;
pub mod query;
pub mod trace;

// Re-export commonly used types
pub use config::{AggregationMode, ConfigError, ConfigLoader, StorageConfig};
pub use query::{DependencyLink, Operation, OperationQueryParameters, TraceQueryParameters};
pub use trace::{
    KeyValue, Log, ParseIdError, Process, Span, SpanId, SpanRef, SpanRefType, Trace, TraceId,
    ValueType,
};

/// Plugin version
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
