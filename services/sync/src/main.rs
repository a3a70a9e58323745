use anyhow::{Context, Result};
use sync_service::config::LoggingConfig;
use sync_service::{SyncConfig, SyncPipeline};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = SyncConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "sync-service",
        version = env!("CARGO_PKG_VERSION"),
        directory = %config.local_directory,
        bucket = %config.bucket,
        region = %config.region,
        "Starting sync service"
    );

    if let Some(port) = config.metrics_port {
        init_metrics(port)?;
    }

    let cancel = cancel_on_shutdown();

    let bucket = config.bucket.clone();
    let report = SyncPipeline::new(config)
        .run(cancel)
        .await
        .with_context(|| format!("Sync to bucket {:?} failed", bucket))?;

    info!(
        uploaded = report.uploader.uploaded,
        skipped = report.uploader.skipped,
        bytes_uploaded = report.uploader.bytes_uploaded,
        "Sync service stopped"
    );

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("sync_service={}", level).parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Serve Prometheus metrics on `port` and describe the counters the pipeline records.
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .with_context(|| format!("Failed to serve metrics on port {}", port))?;

    metrics::describe_counter!("sync.events.forwarded", "Change events handed to the uploader");
    metrics::describe_counter!("sync.events.ignored", "Change events that do not trigger an upload");
    metrics::describe_counter!("sync.watch.errors", "Errors reported by the directory watch");
    metrics::describe_counter!("sync.uploads.completed", "Files written to the bucket");
    metrics::describe_counter!("sync.uploads.failed", "Upload attempts that failed");
    metrics::describe_counter!(
        "sync.bytes.uploaded",
        metrics::Unit::Bytes,
        "Bytes written to the bucket"
    );
    metrics::describe_histogram!(
        "sync.upload.duration_seconds",
        metrics::Unit::Seconds,
        "Time from file open to upload completion"
    );

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Token cancelled on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the other signal still works; the
/// failure is logged.
fn cancel_on_shutdown() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, stopping sync"),
            _ = terminate => info!("Received SIGTERM, stopping sync"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });

    cancel
}
