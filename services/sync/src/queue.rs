//! Unbuffered handoff between the watcher and the uploader.
//!
//! `send` only completes once the receiving side has taken the item, so a slow
//! consumer stalls the producer instead of letting work pile up in memory.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A path waiting to be uploaded. The path string doubles as the object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub path: String,
}

impl UploadTask {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Object key for this task; the path, unmodified.
    pub fn key(&self) -> &str {
        &self.path
    }
}

impl From<&str> for UploadTask {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// The other half of the handoff has gone away.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("event queue closed")]
pub struct QueueClosed;

struct Parcel<T> {
    item: T,
    taken: oneshot::Sender<()>,
}

/// Producing half. Deliberately not `Clone`: the queue has exactly one producer.
pub struct HandoffSender<T> {
    tx: mpsc::Sender<Parcel<T>>,
}

/// Consuming half.
pub struct HandoffReceiver<T> {
    rx: mpsc::Receiver<Parcel<T>>,
}

pub type EventQueueSender = HandoffSender<UploadTask>;
pub type EventQueueReceiver = HandoffReceiver<UploadTask>;

/// Create a single-producer/single-consumer rendezvous channel.
pub fn handoff<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    // One slot holds the parcel in transit; the sender then waits on the
    // acknowledgement, so nothing queues behind it.
    let (tx, rx) = mpsc::channel(1);
    (HandoffSender { tx }, HandoffReceiver { rx })
}

impl<T> HandoffSender<T> {
    /// Hand `item` over, waiting until the receiver has taken it.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        let (taken, ack) = oneshot::channel();
        self.tx
            .send(Parcel { item, taken })
            .await
            .map_err(|_| QueueClosed)?;
        // Dropped without an ack means the receiver went away holding the parcel.
        ack.await.map_err(|_| QueueClosed)
    }
}

impl<T> HandoffReceiver<T> {
    /// Wait for the next item. Returns `None` once the sender is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        let Parcel { item, taken } = self.rx.recv().await?;
        let _ = taken.send(());
        Some(item)
    }
}
