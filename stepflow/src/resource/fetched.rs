//! Adapts a fetched resource version to the artifact contract.

use super::VersionedSource;
use crate::artifact::{ArtifactDestination, ArtifactSource, ByteStream};
use crate::errors::Result;
use crate::worker::{Volume, Worker};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// The artifact a Get step registers.
pub struct FetchedArtifact {
    cache_key: String,
    source: Arc<dyn VersionedSource>,
}

impl FetchedArtifact {
    /// Wraps a fetched version identified by `cache_key`.
    #[must_use]
    pub fn new(cache_key: impl Into<String>, source: Arc<dyn VersionedSource>) -> Self {
        Self {
            cache_key: cache_key.into(),
            source,
        }
    }

    /// The cache key of the resource instance.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// The underlying fetched version.
    #[must_use]
    pub fn versioned_source(&self) -> &Arc<dyn VersionedSource> {
        &self.source
    }
}

impl std::fmt::Debug for FetchedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedArtifact")
            .field("cache_key", &self.cache_key)
            .field("version", &self.source.version())
            .finish()
    }
}

#[async_trait]
impl ArtifactSource for FetchedArtifact {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        debug!(cache_key = %self.cache_key, "streaming fetched resource");
        let out = self.source.stream_out(".").await?;
        dest.stream_in(".", out).await
    }

    async fn stream_file(&self, path: &str) -> Result<ByteStream> {
        self.source.stream_out(path).await
    }

    async fn volume_on(&self, worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>> {
        match self.source.volume() {
            Some(volume) => worker.lookup_volume(volume.handle()).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::read_all;
    use crate::testing::{FakeVersionedSource, FakeWorker, RecordingDestination};

    #[tokio::test]
    async fn test_fetched_artifact_streams_whole_version() {
        let artifact = FetchedArtifact::new("key", Arc::new(FakeVersionedSource::new("X")));
        let dest = RecordingDestination::new();
        artifact.stream_to(&dest).await.unwrap();
        assert_eq!(dest.file("."), Some(b"X".to_vec()));

        let file = read_all(artifact.stream_file("version").await.unwrap()).await.unwrap();
        assert_eq!(file, b"X");
    }

    #[tokio::test]
    async fn test_fetched_artifact_volume_on() {
        let worker = FakeWorker::new("w").with_volume("cache-1");

        let without = FetchedArtifact::new("key", Arc::new(FakeVersionedSource::new("X")));
        assert!(without.volume_on(&worker).await.unwrap().is_none());

        let with = FetchedArtifact::new(
            "key",
            Arc::new(FakeVersionedSource::new("X").with_volume("cache-1")),
        );
        assert_eq!(with.volume_on(&worker).await.unwrap().unwrap().handle(), "cache-1");
    }
}
