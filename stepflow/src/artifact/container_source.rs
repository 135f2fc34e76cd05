//! An artifact living in a directory of a task container.

use super::{ArtifactDestination, ArtifactSource, ByteStream};
use crate::errors::Result;
use crate::worker::{Container, Volume, Worker};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// A task output, read back out of the container that produced it.
pub struct ContainerSource {
    container: Arc<dyn Container>,
    /// Absolute in-container directory, always ending in `/`.
    path: String,
    volume_handle: Option<String>,
}

impl ContainerSource {
    /// Creates a source rooted at `path` inside `container`.
    #[must_use]
    pub fn new(container: Arc<dyn Container>, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self {
            container,
            path,
            volume_handle: None,
        }
    }

    /// Records the volume backing the directory, so other steps on the same
    /// worker can mount it instead of streaming.
    #[must_use]
    pub fn with_volume_handle(mut self, handle: impl Into<String>) -> Self {
        self.volume_handle = Some(handle.into());
        self
    }

    /// Returns the in-container directory.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the backing volume handle, if any.
    #[must_use]
    pub fn volume_handle(&self) -> Option<&str> {
        self.volume_handle.as_deref()
    }
}

impl std::fmt::Debug for ContainerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSource")
            .field("container", &self.container.handle())
            .field("path", &self.path)
            .field("volume_handle", &self.volume_handle)
            .finish()
    }
}

#[async_trait]
impl ArtifactSource for ContainerSource {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        let out = self.container.stream_out(&self.path).await?;
        dest.stream_in(".", out).await
    }

    async fn stream_file(&self, path: &str) -> Result<ByteStream> {
        let full = format!("{}{}", self.path, path.trim_start_matches('/'));
        self.container.stream_out(&full).await
    }

    async fn volume_on(&self, worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>> {
        let Some(handle) = &self.volume_handle else {
            return Ok(None);
        };

        let volume = worker.lookup_volume(handle).await?;
        if volume.is_some() {
            debug!(handle = %handle, worker = worker.name(), "found output volume on worker");
        }
        Ok(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::read_all;
    use crate::testing::{FakeContainer, FakeWorker, RecordingDestination};

    #[tokio::test]
    async fn test_stream_file_reads_from_container_path() {
        let container = Arc::new(FakeContainer::new("c1"));
        container.put_file("/tmp/build/exec/out/result.txt", "42");

        let source = ContainerSource::new(container, "/tmp/build/exec/out");
        let data = read_all(source.stream_file("result.txt").await.unwrap())
            .await
            .unwrap();
        assert_eq!(data, b"42");
    }

    #[tokio::test]
    async fn test_stream_to_sends_whole_directory() {
        let container = Arc::new(FakeContainer::new("c1"));
        container.put_file("/tmp/build/exec/out/a", "A");

        let source = ContainerSource::new(container, "/tmp/build/exec/out/");
        let dest = RecordingDestination::new();
        source.stream_to(&dest).await.unwrap();

        assert!(dest.file(".").is_some());
    }

    #[tokio::test]
    async fn test_volume_on_uses_handle() {
        let container = Arc::new(FakeContainer::new("c1"));
        let worker = FakeWorker::new("w1").with_volume("vol-1");

        let without = ContainerSource::new(container.clone(), "/out");
        assert!(without.volume_on(&worker).await.unwrap().is_none());

        let with = ContainerSource::new(container, "/out").with_volume_handle("vol-1");
        let volume = with.volume_on(&worker).await.unwrap().unwrap();
        assert_eq!(volume.handle(), "vol-1");
    }
}
