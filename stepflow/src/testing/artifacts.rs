//! In-memory artifact sources and destinations.

use crate::artifact::{bytes_stream, read_all, ArtifactDestination, ArtifactSource, ByteStream};
use crate::errors::{FileNotFoundError, Result};
use crate::worker::{Volume, Worker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An artifact made of named in-memory files.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    files: BTreeMap<String, Vec<u8>>,
    volume_handle: Option<String>,
}

impl InMemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source from `(path, content)` pairs.
    #[must_use]
    pub fn from_files(files: &[(&str, &str)]) -> Self {
        let mut source = Self::new();
        for (path, content) in files {
            source = source.with_file(*path, *content);
        }
        source
    }

    /// Adds a file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    /// Claims the source lives in the volume `handle`.
    #[must_use]
    pub fn with_volume(mut self, handle: impl Into<String>) -> Self {
        self.volume_handle = Some(handle.into());
        self
    }
}

#[async_trait]
impl ArtifactSource for InMemorySource {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<()> {
        for (path, content) in &self.files {
            dest.stream_in(path, bytes_stream(content.clone())).await?;
        }
        Ok(())
    }

    async fn stream_file(&self, path: &str) -> Result<ByteStream> {
        self.files
            .get(path)
            .map(|content| bytes_stream(content.clone()))
            .ok_or_else(|| FileNotFoundError::new(path).into())
    }

    async fn volume_on(&self, worker: &dyn Worker) -> Result<Option<Arc<dyn Volume>>> {
        match &self.volume_handle {
            Some(handle) => worker.lookup_volume(handle).await,
            None => Ok(None),
        }
    }
}

/// A destination that keeps everything streamed into it.
#[derive(Debug, Default)]
pub struct RecordingDestination {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl RecordingDestination {
    /// Creates an empty destination.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns what was streamed to `path`.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Returns every path streamed to, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactDestination for RecordingDestination {
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        let content = read_all(stream).await?;
        self.files.lock().insert(path.to_string(), content);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_source_streams_each_file() {
        let source = InMemorySource::from_files(&[("a", "1"), ("b/c", "2")]);
        let dest = RecordingDestination::new();
        source.stream_to(&dest).await.unwrap();
        assert_eq!(dest.paths(), vec!["a".to_string(), "b/c".to_string()]);
    }

    #[tokio::test]
    async fn test_in_memory_source_missing_file() {
        let source = InMemorySource::new();
        assert!(source.stream_file("nope").await.is_err());
    }
}
