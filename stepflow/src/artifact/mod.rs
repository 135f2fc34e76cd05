//! Artifacts: opaque, streamable bundles of files produced by steps.
//!
//! This module provides:
//! - The [`ArtifactSource`] and [`ArtifactDestination`] contracts
//! - The build-wide [`ArtifactRepository`]
//! - Sources backed by in-memory blobs and by task containers

mod blob;
mod container_source;
mod repository;

pub use blob::BlobSource;
pub use container_source::ContainerSource;
pub use repository::ArtifactRepository;

use crate::errors::Result;
use crate::worker::{Volume, Worker};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A byte stream moving artifact content between steps and containers.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Something an artifact can be streamed into.
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    /// Streams content into `path`, relative to the destination root.
    ///
    /// A path of `"."` carries a whole bundle rather than a single file.
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()>;
}

/// A named bundle of files produced by a step.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Streams the whole bundle into `dest`.
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()>;

    /// Streams a single file out of the bundle.
    async fn stream_file(&self, path: &str) -> Result<ByteStream>;

    /// Locates an equivalent volume already present on `worker`.
    ///
    /// `None` means the bundle must be streamed to that worker.
    async fn volume_on(&self, worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>>;
}

/// Wraps bytes as a [`ByteStream`].
#[must_use]
pub fn bytes_stream(bytes: impl Into<Vec<u8>>) -> ByteStream {
    Box::pin(std::io::Cursor::new(bytes.into()))
}

/// Reads a stream to its end.
pub async fn read_all(mut stream: ByteStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Joins a destination-relative path onto a prefix directory.
pub(crate) fn join_path(prefix: &str, path: &str) -> String {
    let path = path.trim_start_matches("./");
    if path.is_empty() || path == "." {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), path)
    }
}
