//! Directory watching.
//!
//! [`EventSource`] binds a single non-recursive `notify` watch and bridges its
//! callback thread into two tokio channels (events and errors). [`Watcher`]
//! drains those channels, keeps create/write notifications, and hands each
//! path to the uploader through the event queue.

use crate::queue::{EventQueueSender, UploadTask};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors raised by the watch layer
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to watch directory {path}: {message}")]
    Init { path: String, message: String },

    #[error("Watch error: {0}")]
    Runtime(String),
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Runtime(err.to_string())
    }
}

/// Set of filesystem operations carried by one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Op(u8);

impl Op {
    pub const CREATE: Op = Op(1);
    pub const WRITE: Op = Op(1 << 1);
    pub const REMOVE: Op = Op(1 << 2);
    pub const RENAME: Op = Op(1 << 3);
    pub const CHMOD: Op = Op(1 << 4);

    pub fn contains(self, other: Op) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether this notification should trigger an upload.
    pub fn is_upload_trigger(self) -> bool {
        self.contains(Op::CREATE) || self.contains(Op::WRITE)
    }

    pub fn from_kind(kind: &EventKind) -> Op {
        match kind {
            EventKind::Create(_) => Op::CREATE,
            EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => Op::WRITE,
            EventKind::Modify(ModifyKind::Metadata(_)) => Op::CHMOD,
            EventKind::Modify(ModifyKind::Name(_)) => Op::RENAME,
            EventKind::Remove(_) => Op::REMOVE,
            _ => Op::default(),
        }
    }
}

impl BitOr for Op {
    type Output = Op;

    fn bitor(self, rhs: Op) -> Op {
        Op(self.0 | rhs.0)
    }
}

/// One raw notification for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub op: Op,
}

impl FileChangeEvent {
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }

    /// Split a notify event into one change per affected path.
    pub fn from_notify(event: notify::Event) -> Vec<FileChangeEvent> {
        let op = Op::from_kind(&event.kind);
        event
            .paths
            .into_iter()
            .map(|path| FileChangeEvent { path, op })
            .collect()
    }

    /// The upload this change calls for, if any.
    pub fn upload_task(&self) -> Option<UploadTask> {
        self.op
            .is_upload_trigger()
            .then(|| UploadTask::new(self.path.to_string_lossy().into_owned()))
    }
}

/// The one directory watched for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    path: String,
}

impl WatchTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The configured directory string, exactly as registered with the watch.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Receiving ends of the watch bridge.
pub struct WatchStreams {
    pub events: mpsc::Receiver<FileChangeEvent>,
    pub errors: mpsc::Receiver<WatchError>,
}

impl WatchStreams {
    pub fn new(
        events: mpsc::Receiver<FileChangeEvent>,
        errors: mpsc::Receiver<WatchError>,
    ) -> Self {
        Self { events, errors }
    }
}

/// Live OS watch on a [`WatchTarget`]. Dropping it releases the watch and
/// closes both streams.
pub struct EventSource {
    watcher: RecommendedWatcher,
    target: WatchTarget,
}

impl EventSource {
    /// Register a non-recursive watch on `target`.
    ///
    /// The notify callback runs on its own thread and blocks when `buffer`
    /// events are pending, pushing backpressure onto the OS event queue.
    pub fn bind(target: WatchTarget, buffer: usize) -> Result<(Self, WatchStreams), WatchError> {
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(buffer);

        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in FileChangeEvent::from_notify(event) {
                        if event_tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = error_tx.blocking_send(WatchError::from(err));
                }
            },
        )
        .map_err(|e| WatchError::Init {
            path: target.path().to_string(),
            message: e.to_string(),
        })?;

        watcher
            .watch(Path::new(target.path()), RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Init {
                path: target.path().to_string(),
                message: e.to_string(),
            })?;

        info!(path = %target.path(), "Watching directory");

        Ok((
            Self { watcher, target },
            WatchStreams::new(event_rx, error_rx),
        ))
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Unregister the watch and drop the handle.
    pub fn close(mut self) {
        if let Err(e) = self.watcher.unwatch(Path::new(self.target.path())) {
            debug!(path = %self.target.path(), error = %e, "Unwatch failed");
        }
        info!(path = %self.target.path(), "Released directory watch");
    }
}

/// Counters reported when the watcher loop ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatcherReport {
    pub forwarded: u64,
    pub ignored: u64,
    pub errors: u64,
}

/// Filters raw changes and feeds the event queue.
pub struct Watcher {
    queue: EventQueueSender,
}

impl Watcher {
    pub fn new(queue: EventQueueSender) -> Self {
        Self { queue }
    }

    /// Run until either stream closes, the queue closes, or `cancel` fires.
    ///
    /// Watch-layer errors are logged and otherwise ignored.
    pub async fn run(self, streams: WatchStreams, cancel: CancellationToken) -> WatcherReport {
        let WatchStreams {
            mut events,
            mut errors,
        } = streams;
        let mut report = WatcherReport::default();

        info!("Watcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Watcher cancelled");
                    break;
                }
                err = errors.recv() => {
                    let Some(err) = err else {
                        info!("Watch error stream closed");
                        break;
                    };
                    log_watch_error(&mut report, &err);
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        // Errors queued behind the last event still get logged.
                        while let Ok(err) = errors.try_recv() {
                            log_watch_error(&mut report, &err);
                        }
                        info!("Event stream closed");
                        break;
                    };
                    let Some(task) = event.upload_task() else {
                        debug!(path = %event.path.display(), op = ?event.op, "Ignoring event");
                        report.ignored += 1;
                        metrics::counter!("sync.events.ignored").increment(1);
                        continue;
                    };

                    info!(path = %task.path, "Created or modified file");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("Watcher cancelled while handing off");
                            break;
                        }
                        sent = self.queue.send(task) => {
                            if sent.is_err() {
                                warn!("Event queue closed, stopping watcher");
                                break;
                            }
                        }
                    }

                    report.forwarded += 1;
                    metrics::counter!("sync.events.forwarded").increment(1);
                }
            }
        }

        report
    }
}

fn log_watch_error(report: &mut WatcherReport, err: &WatchError) {
    warn!(error = %err, "Watch error");
    report.errors += 1;
    metrics::counter!("sync.watch.errors").increment(1);
}
