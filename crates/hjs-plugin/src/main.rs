//! humio-jaeger-storage - Jaeger span storage backed by Humio
//!
//! Runs the storage components until interrupted, or answers one-off read
//! queries for diagnosis.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use hjs_core::{ConfigLoader, OperationQueryParameters, StorageConfig, TraceId};
use hjs_humio::Context;
use hjs_spanstore::{
    read_client, DependencyCache, HumioSpanReader, HumioStorage, SpanReader,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "humio-jaeger-storage")]
#[command(version)]
#[command(about = "Jaeger span storage backed by Humio", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "HJS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the writer flush and dependency refresh until interrupted
    Serve,

    /// List known services
    Services,

    /// List known operations
    Operations {
        /// Only operations of this service
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Fetch one trace by id
    Trace {
        /// Trace id in hex
        id: String,
    },

    /// Compute the service dependency graph
    Dependencies,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .with_cli_path(cli.config.clone())
        .load()
        .context("Failed to load configuration")?;

    init_logging(&cli, &config)?;

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Services => {
            let services = reader(&config)?
                .get_services(&Context::background())
                .await?;
            print_json(&services)
        }
        Commands::Operations { service } => {
            let params = OperationQueryParameters {
                service_name: service,
                span_kind: None,
            };
            let operations = reader(&config)?
                .get_operations(&Context::background(), &params)
                .await?;
            print_json(&operations)
        }
        Commands::Trace { id } => {
            let trace_id: TraceId = id.parse()?;
            match reader(&config)?
                .get_trace(&Context::background(), trace_id)
                .await?
            {
                Some(trace) => print_json(&trace),
                None => anyhow::bail!("Trace {} not found", trace_id),
            }
        }
        Commands::Dependencies => {
            let cache = DependencyCache::new(
                read_client(&config)?,
                config.humio.repository.clone(),
                config.dependencies.clone(),
            );
            cache.refresh(&Context::background()).await?;
            print_json(cache.links().as_ref())
        }
    }
}

/// CLI verbosity takes precedence over the configured level
fn init_logging(cli: &Cli, config: &StorageConfig) -> anyhow::Result<()> {
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr);

    match cli.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        "text" => tracing::subscriber::set_global_default(builder.finish())?,
        other => anyhow::bail!("Unknown log format: {other} (expected json or text)"),
    }
    Ok(())
}

fn reader(config: &StorageConfig) -> anyhow::Result<HumioSpanReader> {
    Ok(HumioSpanReader::new(
        read_client(config)?,
        config.humio.repository.clone(),
        config.reader.clone(),
    ))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: &StorageConfig) -> anyhow::Result<()> {
    let storage = HumioStorage::new(config).context("Failed to initialize storage")?;
    info!(
        url = %config.humio.url,
        repository = %config.humio.repository,
        version = hjs_core::PLUGIN_VERSION,
        "Starting span storage"
    );
    storage.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    storage.shutdown().await;
    let stats = storage.span_writer().stats();
    info!(
        events_sent = stats.events_sent,
        events_dropped = stats.events_dropped,
        batches_sent = stats.batches_sent,
        failed_flushes = stats.failed_flushes,
        "Span writer statistics"
    );
    Ok(())
}
