//! Startup, wiring and failure handling for the sync pipeline.
//!
//! ```text
//! EventSource ──▶ Watcher ──handoff──▶ Uploader ──▶ StorageSink
//!                    ▲                    │
//!                    └── CancellationToken┘
//! ```

use crate::config::{FailureConfig, PolicyKind, SyncConfig};
use crate::queue::handoff;
use crate::s3_session::{S3Sink, Session, SessionError};
use crate::storage::StorageSink;
use crate::uploader::{TaskError, Uploader, UploaderReport};
use crate::watcher::{EventSource, WatchError, WatchStreams, WatchTarget, Watcher, WatcherReport};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors that stop the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("{0} task panicked: {1}")]
    Panicked(&'static str, String),
}

/// What to do with a failed upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Terminate,
    Skip,
    RetryAfter(Duration),
}

/// Per-task failure policy. Fail-fast unless configured otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Skip,
    Retry {
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    },
}

impl From<&FailureConfig> for FailurePolicy {
    fn from(config: &FailureConfig) -> Self {
        match config.policy {
            PolicyKind::FailFast => FailurePolicy::FailFast,
            PolicyKind::Skip => FailurePolicy::Skip,
            PolicyKind::Retry => FailurePolicy::Retry {
                max_attempts: config.max_attempts,
                initial_backoff: config.initial_backoff(),
                max_backoff: config.max_backoff(),
            },
        }
    }
}

impl FailurePolicy {
    /// Fresh backoff state for one task.
    pub fn backoff(&self) -> ExponentialBackoff {
        match self {
            FailurePolicy::Retry {
                initial_backoff,
                max_backoff,
                ..
            } => ExponentialBackoff {
                initial_interval: *initial_backoff,
                current_interval: *initial_backoff,
                max_interval: *max_backoff,
                max_elapsed_time: None,
                ..Default::default()
            },
            _ => ExponentialBackoff::default(),
        }
    }

    /// Decide after the `attempt`-th failure of a task (1-based).
    pub fn decide(&self, attempt: u32, backoff: &mut ExponentialBackoff) -> Decision {
        match self {
            FailurePolicy::FailFast => Decision::Terminate,
            FailurePolicy::Skip => Decision::Skip,
            FailurePolicy::Retry { max_attempts, .. } => {
                if attempt >= *max_attempts {
                    return Decision::Terminate;
                }
                backoff
                    .next_backoff()
                    .map(Decision::RetryAfter)
                    .unwrap_or(Decision::Terminate)
            }
        }
    }
}

/// Counters from both loops once the pipeline stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub watcher: WatcherReport,
    pub uploader: UploaderReport,
}

/// Top-level owner of the session, the watch and both loops.
pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Establish the session and bind the watch, then run until cancelled or a
    /// fatal error occurs.
    pub async fn run(self, cancel: CancellationToken) -> Result<PipelineReport, PipelineError> {
        let config = self.config;
        let target = WatchTarget::new(config.local_directory.clone());

        let (session, (source, streams)) = tokio::try_join!(
            async { Session::establish(&config).await.map_err(PipelineError::from) },
            async {
                EventSource::bind(target, config.watch.event_buffer).map_err(PipelineError::from)
            },
        )?;

        let sink = Arc::new(S3Sink::new(session, &config.upload));
        let policy = FailurePolicy::from(&config.failure);

        let result = run_pipeline(streams, sink, config.bucket.clone(), policy, cancel).await;

        source.close();
        result
    }
}

/// Wire watcher and uploader through the handoff and supervise both tasks.
///
/// Returns when the uploader stops: on cancellation or end of the event
/// stream with `Ok`, on a fatal task error with `Err` after stopping the watcher.
pub async fn run_pipeline(
    streams: WatchStreams,
    sink: Arc<dyn StorageSink>,
    bucket: String,
    policy: FailurePolicy,
    cancel: CancellationToken,
) -> Result<PipelineReport, PipelineError> {
    let token = cancel.child_token();
    let (queue_tx, queue_rx) = handoff();

    let watcher_handle = tokio::spawn(Watcher::new(queue_tx).run(streams, token.clone()));
    let uploader_handle = tokio::spawn(Uploader::new(sink, bucket, policy).run(queue_rx, token.clone()));

    info!("Sync pipeline started");

    let uploader_result = uploader_handle.await;

    // Whatever ended the uploader, the watcher has nobody left to feed.
    token.cancel();

    let watcher_report = watcher_handle
        .await
        .map_err(|e| PipelineError::Panicked("watcher", e.to_string()))?;

    let uploader_report = match uploader_result {
        Ok(Ok(report)) => report,
        Ok(Err(err)) => {
            error!(error = %err, path = %err.path(), "Stopping sync pipeline");
            return Err(err.into());
        }
        Err(e) => return Err(PipelineError::Panicked("uploader", e.to_string())),
    };

    info!(
        forwarded = watcher_report.forwarded,
        uploaded = uploader_report.uploaded,
        skipped = uploader_report.skipped,
        watch_errors = watcher_report.errors,
        "Sync pipeline stopped"
    );

    Ok(PipelineReport {
        watcher: watcher_report,
        uploader: uploader_report,
    })
}
