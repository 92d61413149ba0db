//! HJS Spanstore - Jaeger storage backed by Humio
//!
//! - **Writer**: spans to events, buffered and flushed periodically
//! - **Reader**: trace lookup, two-phase trace search, catalog
//! - **Dependencies**: periodically rebuilt service dependency graph
//!
//! [`HumioStorage`] wires them together from a [`StorageConfig`] and owns
//! their background tasks.

pub mod assembly;
pub mod catalog;
pub mod dependencies;
pub mod error;
pub mod reader;
pub mod rows;
pub mod traits;
pub mod writer;

pub use catalog::Catalog;
pub use dependencies::DependencyCache;
pub use error::{StoreError, StoreResult};
pub use reader::HumioSpanReader;
pub use traits::{DependencyReader, SpanReader, SpanWriter};
pub use writer::HumioSpanWriter;

use hjs_core::StorageConfig;
use hjs_humio::{Context, HumioClient};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Client authenticated with the read token
pub fn read_client(config: &StorageConfig) -> StoreResult<Arc<HumioClient>> {
    let client = HumioClient::new(
        &config.humio,
        config.humio.read_token.as_deref(),
        &config.jobs,
    )?;
    Ok(Arc::new(client))
}

/// Client authenticated with the ingest token
pub fn write_client(config: &StorageConfig) -> StoreResult<Arc<HumioClient>> {
    let client = HumioClient::new(
        &config.humio,
        config.humio.write_token.as_deref(),
        &config.jobs,
    )?;
    Ok(Arc::new(client))
}

/// Reader, writer and dependency reader sharing one configuration
pub struct HumioStorage {
    reader: Arc<HumioSpanReader>,
    writer: Arc<HumioSpanWriter>,
    dependencies: Arc<DependencyCache>,
    dependencies_enabled: bool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HumioStorage {
    /// Build every component; fails if either token is missing
    pub fn new(config: &StorageConfig) -> StoreResult<Self> {
        let read = read_client(config)?;
        let write = write_client(config)?;
        let repository = config.humio.repository.clone();

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            reader: Arc::new(HumioSpanReader::new(
                read.clone(),
                repository.clone(),
                config.reader.clone(),
            )),
            writer: Arc::new(HumioSpanWriter::new(write, &config.ingest)),
            dependencies: Arc::new(DependencyCache::new(
                read,
                repository,
                config.dependencies.clone(),
            )),
            dependencies_enabled: config.dependencies.enabled,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn span_reader(&self) -> Arc<HumioSpanReader> {
        self.reader.clone()
    }

    pub fn span_writer(&self) -> Arc<HumioSpanWriter> {
        self.writer.clone()
    }

    pub fn dependency_reader(&self) -> Arc<DependencyCache> {
        self.dependencies.clone()
    }

    /// Start the flush task and, if enabled, the dependency refresh task
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Storage background tasks already running");
            return;
        }

        tasks.push(self.writer.clone().start(self.shutdown_tx.subscribe()));
        if self.dependencies_enabled {
            tasks.push(
                self.dependencies
                    .clone()
                    .start(self.shutdown_tx.subscribe()),
            );
        }
        info!(tasks = tasks.len(), "Storage background tasks started");
    }

    /// Stop the background tasks; the writer flushes what it still holds
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            // Never started: flush directly
            if let Err(e) = self.writer.flush(&Context::background()).await {
                warn!(error = %e, "Flush on shutdown failed");
            }
            return;
        }

        let _ = self.shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Storage stopped");
    }
}
