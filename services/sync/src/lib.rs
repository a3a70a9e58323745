//! Sync Service
//!
//! Watches one local directory and replicates every created or modified file to
//! an S3 bucket, using the file's path as the object key.
//!
//! ## Architecture
//!
//! ```text
//! notify watch          Watcher              Uploader              S3 Bucket
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐      ┌──────────────┐
//! │ EventSource  │────▶│ create/write │────▶│ one task at  │─────▶│ key = path   │
//! │ (one dir)    │     │ filter       │  ▲  │ a time       │      │              │
//! └──────────────┘     └──────────────┘  │  └──────────────┘      └──────────────┘
//!        │ errors             ▲          │         │
//!        └──── logged ────────┘    unbuffered      └── failure policy ──▶ Supervisor
//!                                   handoff
//! ```
//!
//! The handoff has no capacity: the watcher waits for the uploader to take each
//! path, and uploads are issued strictly in the order paths were handed off.

pub mod config;
pub mod queue;
pub mod s3_session;
pub mod storage;
pub mod supervisor;
pub mod uploader;
pub mod watcher;

pub use config::{ConfigError, PolicyKind, SyncConfig};
pub use queue::{handoff, EventQueueReceiver, EventQueueSender, QueueClosed, UploadTask};
pub use s3_session::{S3Sink, Session, SessionError};
pub use storage::{SinkError, StorageSink, UploadBody};
pub use supervisor::{run_pipeline, Decision, FailurePolicy, PipelineError, PipelineReport, SyncPipeline};
pub use uploader::{TaskError, UploadReceipt, Uploader, UploaderReport};
pub use watcher::{
    EventSource, FileChangeEvent, Op, WatchError, WatchStreams, WatchTarget, Watcher, WatcherReport,
};
