//! Sequential consumer of the event queue.
//!
//! Exactly one task is in flight at a time: the next path is not taken off the
//! queue until the previous upload has finished, so uploads reach the sink in
//! enqueue order.

use crate::queue::{EventQueueReceiver, UploadTask};
use crate::storage::{SinkError, StorageSink, UploadBody};
use crate::supervisor::{Decision, FailurePolicy};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Errors for a single upload task
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unable to open file {path:?}: {source}")]
    FileOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to upload {key:?} to {bucket:?}: {source}")]
    Upload {
        bucket: String,
        key: String,
        #[source]
        source: SinkError,
    },
}

impl TaskError {
    pub fn path(&self) -> &str {
        match self {
            TaskError::FileOpen { path, .. } => path,
            TaskError::Upload { key, .. } => key,
        }
    }
}

/// Details of a completed upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: String,
    pub size_bytes: u64,
    pub elapsed: Duration,
}

/// Counters reported when the uploader loop ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploaderReport {
    pub uploaded: u64,
    pub skipped: u64,
    pub bytes_uploaded: u64,
}

enum TaskOutcome {
    Uploaded(UploadReceipt),
    Skipped,
}

/// Streams each queued path to the sink under the configured bucket.
pub struct Uploader {
    sink: Arc<dyn StorageSink>,
    bucket: String,
    policy: FailurePolicy,
}

impl Uploader {
    pub fn new(sink: Arc<dyn StorageSink>, bucket: impl Into<String>, policy: FailurePolicy) -> Self {
        Self {
            sink,
            bucket: bucket.into(),
            policy,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Consume tasks until the queue closes or `cancel` fires.
    ///
    /// A task error the failure policy decides to terminate on is returned;
    /// nothing further is taken off the queue after it.
    pub async fn run(
        self,
        mut queue: EventQueueReceiver,
        cancel: CancellationToken,
    ) -> Result<UploaderReport, TaskError> {
        let mut report = UploaderReport::default();

        info!(bucket = %self.bucket, "Uploader started");

        loop {
            let task = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Uploader cancelled");
                    break;
                }
                task = queue.recv() => match task {
                    Some(task) => task,
                    None => {
                        info!("Event queue closed");
                        break;
                    }
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(path = %task.path, "Upload interrupted by shutdown");
                    break;
                }
                outcome = self.process(&task) => outcome?,
            };

            match outcome {
                TaskOutcome::Uploaded(receipt) => {
                    report.uploaded += 1;
                    report.bytes_uploaded += receipt.size_bytes;
                }
                TaskOutcome::Skipped => report.skipped += 1,
            }
        }

        Ok(report)
    }

    /// Upload one task, applying the failure policy to any error.
    async fn process(&self, task: &UploadTask) -> Result<TaskOutcome, TaskError> {
        let mut backoff = self.policy.backoff();
        let mut attempt = 1;

        loop {
            let err = match self.upload(task).await {
                Ok(receipt) => return Ok(TaskOutcome::Uploaded(receipt)),
                Err(err) => err,
            };

            metrics::counter!("sync.uploads.failed").increment(1);

            match self.policy.decide(attempt, &mut backoff) {
                Decision::Terminate => {
                    error!(error = %err, attempt, "Upload failed");
                    return Err(err);
                }
                Decision::Skip => {
                    warn!(error = %err, "Upload failed, skipping file");
                    return Ok(TaskOutcome::Skipped);
                }
                Decision::RetryAfter(delay) => {
                    warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Upload failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Open the task's file and stream it to the sink. The file is closed
    /// before this returns, whatever the outcome.
    #[instrument(skip(self, task), fields(path = %task.path))]
    pub async fn upload(&self, task: &UploadTask) -> Result<UploadReceipt, TaskError> {
        let started = Instant::now();

        let body = UploadBody::open(&task.path)
            .await
            .map_err(|source| TaskError::FileOpen {
                path: task.path.clone(),
                source,
            })?;
        let size_bytes = body.size_bytes();

        self.sink
            .put(&self.bucket, task.key(), body)
            .await
            .map_err(|source| TaskError::Upload {
                bucket: self.bucket.clone(),
                key: task.key().to_string(),
                source,
            })?;

        let elapsed = started.elapsed();

        metrics::counter!("sync.uploads.completed").increment(1);
        metrics::counter!("sync.bytes.uploaded").increment(size_bytes);
        metrics::histogram!("sync.upload.duration_seconds").record(elapsed.as_secs_f64());

        info!(
            bucket = %self.bucket,
            key = %task.key(),
            size_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "Successfully uploaded file"
        );

        Ok(UploadReceipt {
            key: task.key().to_string(),
            size_bytes,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailureConfig, PolicyKind};
    use crate::queue::handoff;
    use crate::storage::testing::{GatedSink, MemorySink};
    use crate::storage::MockStorageSink;
    use std::time::Duration;
    use tokio_test::{assert_pending, task};

    fn policy(kind: PolicyKind) -> FailurePolicy {
        FailurePolicy::from(&FailureConfig {
            policy: kind,
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        })
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_upload_uses_bucket_and_path_as_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "img1.jpg", b"jpeg bytes");
        let expected_key = path.clone();

        let mut sink = MockStorageSink::new();
        sink.expect_put().times(1).returning(move |bucket, key, body| {
            assert_eq!(bucket, "photos-bucket");
            assert_eq!(key, expected_key);
            assert_eq!(body.size_bytes(), 10);
            Ok(())
        });

        let uploader = Uploader::new(Arc::new(sink), "photos-bucket", policy(PolicyKind::FailFast));
        let receipt = uploader.upload(&UploadTask::new(path.clone())).await.unwrap();
        assert_eq!(receipt.key, path);
        assert_eq!(receipt.size_bytes, 10);
    }

    #[tokio::test]
    async fn test_missing_file_is_file_open_error() {
        let mut sink = MockStorageSink::new();
        sink.expect_put().times(0);

        let uploader = Uploader::new(Arc::new(sink), "photos-bucket", policy(PolicyKind::FailFast));
        let err = uploader
            .upload(&UploadTask::from("/data/in/vanished.jpg"))
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::FileOpen { .. }));
        assert_eq!(err.path(), "/data/in/vanished.jpg");
        assert!(err.to_string().contains("/data/in/vanished.jpg"));
    }

    #[tokio::test]
    async fn test_sink_error_names_bucket_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "a.txt", b"a");

        let mut sink = MockStorageSink::new();
        sink.expect_put().times(1).returning(|_, _, _| {
            Err(SinkError::Request {
                operation: "put_object",
                message: "AccessDenied".to_string(),
            })
        });

        let uploader = Uploader::new(Arc::new(sink), "photos-bucket", policy(PolicyKind::FailFast));
        let err = uploader.upload(&UploadTask::new(path.clone())).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("photos-bucket"));
        assert!(message.contains(&path));
        assert!(message.contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_consuming() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_file(&dir, "present.txt", b"data");
        let sink = Arc::new(MemorySink::default());

        let (tx, rx) = handoff();
        let uploader = Uploader::new(sink.clone(), "b", policy(PolicyKind::FailFast));
        let consumer = tokio::spawn(uploader.run(rx, CancellationToken::new()));

        tx.send(UploadTask::from("/nowhere/missing.txt")).await.unwrap();
        let result = consumer.await.unwrap();

        assert!(matches!(result, Err(TaskError::FileOpen { .. })));
        assert!(tx.send(UploadTask::new(present)).await.is_err());
        assert!(sink.puts().is_empty());
    }

    #[tokio::test]
    async fn test_skip_policy_continues() {
        let dir = tempfile::tempdir().unwrap();
        let present = write_file(&dir, "present.txt", b"data");
        let sink = Arc::new(MemorySink::default());

        let (tx, rx) = handoff();
        let uploader = Uploader::new(sink.clone(), "b", policy(PolicyKind::Skip));
        let consumer = tokio::spawn(uploader.run(rx, CancellationToken::new()));

        tx.send(UploadTask::from("/nowhere/missing.txt")).await.unwrap();
        tx.send(UploadTask::new(present.clone())).await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.bytes_uploaded, 4);
        assert_eq!(sink.puts(), vec![("b".to_string(), present)]);
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "flaky.txt", b"payload");
        let sink = Arc::new(MemorySink::failing_first(2));

        let (tx, rx) = handoff();
        let uploader = Uploader::new(sink.clone(), "b", policy(PolicyKind::Retry));
        let consumer = tokio::spawn(uploader.run(rx, CancellationToken::new()));

        tx.send(UploadTask::new(path.clone())).await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(sink.object(&path), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "down.txt", b"payload");
        let sink = Arc::new(MemorySink::failing_first(10));

        let (tx, rx) = handoff();
        let uploader = Uploader::new(sink.clone(), "b", policy(PolicyKind::Retry));
        let consumer = tokio::spawn(uploader.run(rx, CancellationToken::new()));

        tx.send(UploadTask::new(path)).await.unwrap();
        let result = consumer.await.unwrap();
        assert!(matches!(result, Err(TaskError::Upload { .. })));
        assert!(sink.puts().is_empty());
    }

    #[tokio::test]
    async fn test_next_task_waits_for_upload_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "img1.jpg", b"jpeg");
        let sink = Arc::new(GatedSink::default());

        let (tx, rx) = handoff();
        let uploader = Uploader::new(sink.clone(), "b", policy(PolicyKind::FailFast));
        let consumer = tokio::spawn(uploader.run(rx, CancellationToken::new()));

        tx.send(UploadTask::new(path.clone())).await.unwrap();
        while sink.started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The uploader is busy with the first put, so nobody takes the second task.
        let mut second = task::spawn(tx.send(UploadTask::new(path.clone())));
        assert_pending!(second.poll());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_pending!(second.poll());
        assert_eq!(sink.started(), 1);

        sink.release();
        second.await.unwrap();
        drop(tx);

        let report = consumer.await.unwrap().unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(sink.max_in_flight(), 1);
        assert_eq!(
            sink.puts(),
            vec![("b".to_string(), path.clone()), ("b".to_string(), path)]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_any_task() {
        let (_tx, rx) = handoff();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let uploader = Uploader::new(Arc::new(MemorySink::default()), "b", policy(PolicyKind::FailFast));
        let report = uploader.run(rx, cancel).await.unwrap();
        assert_eq!(report, UploaderReport::default());
    }
}
