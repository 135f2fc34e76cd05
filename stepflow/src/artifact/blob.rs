//! A single-file artifact held in memory.

use super::{bytes_stream, ArtifactDestination, ArtifactSource, ByteStream};
use crate::errors::{FileNotFoundError, Result};
use crate::worker::{Volume, Worker};
use async_trait::async_trait;
use std::sync::Arc;

/// An artifact made of one buffered blob.
///
/// User-supplied uploads land here: the blob is the whole bundle, so it is
/// streamed to destinations at `"."` and is also the answer for any file path.
#[derive(Clone)]
pub struct BlobSource {
    data: Arc<Vec<u8>>,
}

impl BlobSource {
    /// Creates a blob source.
    #[must_use]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }

    /// Returns the buffered bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl std::fmt::Debug for BlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobSource")
            .field("len", &self.data.len())
            .finish()
    }
}

#[async_trait]
impl ArtifactSource for BlobSource {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        dest.stream_in(".", bytes_stream(self.data.as_slice())).await
    }

    async fn stream_file(&self, path: &str) -> Result<ByteStream> {
        if path.is_empty() {
            return Err(FileNotFoundError::new(path).into());
        }
        Ok(bytes_stream(self.data.as_slice()))
    }

    async fn volume_on(&self, _worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>> {
        Ok(None)
    }
}
