//! The storage sink seam: anything that accepts a (bucket, key, byte stream) write.

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Errors returned by a storage sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("No upload ID in multipart response")]
    MissingUploadId,

    #[error("Failed to read upload body: {0}")]
    Io(#[from] io::Error),
}

/// An opened file ready to be streamed. The handle is released when the body
/// is dropped, which happens as soon as the sink call that consumed it returns.
#[derive(Debug)]
pub struct UploadBody {
    file: File,
    len: u64,
}

impl UploadBody {
    /// Open `path` for reading and capture its length at open time.
    pub async fn open(path: &str) -> io::Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self { file, len })
    }

    pub fn size_bytes(&self) -> u64 {
        self.len
    }

    pub fn into_file(self) -> File {
        self.file
    }

    /// Read up to `max` bytes, stopping early only at end of file.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(max);
        (&mut self.file).take(max as u64).read_to_end(&mut chunk).await?;
        Ok(chunk)
    }

    pub async fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len as usize);
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Reliable object write. Implementations may split large bodies into parts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, body: UploadBody) -> Result<(), SinkError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_reads_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let mut body = UploadBody::open(&path.to_string_lossy()).await.unwrap();
        assert_eq!(body.size_bytes(), 10);

        assert_eq!(body.read_chunk(4).await.unwrap().len(), 4);
        assert_eq!(body.read_chunk(4).await.unwrap().len(), 4);
        assert_eq!(body.read_chunk(4).await.unwrap().len(), 2);
        assert!(body.read_chunk(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let err = UploadBody::open("/definitely/not/here.jpg").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
