//! A fake resource fetcher.

use crate::artifact::{bytes_stream, read_all, ByteStream};
use crate::cancellation::CancellationToken;
use crate::core::{MetadataField, Version};
use crate::errors::{ExecError, Result};
use crate::events::BuildStepDelegate;
use crate::resource::{ResourceFetcher, ResourceInstance, ResourceTypes, Session, VersionedSource};
use crate::worker::Volume;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::FakeVolume;

/// A fetched version whose whole content is one blob.
#[derive(Debug, Default)]
pub struct FakeVersionedSource {
    content: Vec<u8>,
    version: Version,
    metadata: Vec<MetadataField>,
    volume: Option<String>,
    streamed_in: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeVersionedSource {
    /// Creates a source holding `content`.
    #[must_use]
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<MetadataField>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Claims the content lives in the cache volume `handle`.
    #[must_use]
    pub fn with_volume(mut self, handle: impl Into<String>) -> Self {
        self.volume = Some(handle.into());
        self
    }

    /// Everything streamed in so far.
    #[must_use]
    pub fn streamed_in(&self) -> Vec<(String, Vec<u8>)> {
        self.streamed_in.lock().clone()
    }
}

#[async_trait]
impl VersionedSource for FakeVersionedSource {
    fn version(&self) -> Version {
        self.version.clone()
    }

    fn metadata(&self) -> Vec<MetadataField> {
        self.metadata.clone()
    }

    async fn stream_out(&self, _path: &str) -> Result<ByteStream> {
        Ok(bytes_stream(self.content.clone()))
    }

    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        let content = read_all(stream).await?;
        self.streamed_in.lock().push((path.to_string(), content));
        Ok(())
    }

    fn volume(&self) -> Option<Arc<dyn Volume>> {
        self.volume
            .as_ref()
            .map(|handle| Arc::new(FakeVolume::new(handle.clone())) as Arc<dyn Volume>)
    }
}

#[derive(Debug, Clone)]
enum FetchOutcome {
    Fetched,
    ScriptFailed(i32),
    Error(String),
    BlockUntilCancelled,
}

/// A fetcher returning [`FakeVersionedSource`]s and recording requests.
///
/// The fetched source reports the requested version.
#[derive(Debug)]
pub struct FakeResourceFetcher {
    content: Vec<u8>,
    metadata: Vec<MetadataField>,
    outcome: FetchOutcome,
    fetched: Mutex<Vec<ResourceInstance>>,
    sessions: Mutex<Vec<Session>>,
}

impl Default for FakeResourceFetcher {
    fn default() -> Self {
        Self::new("")
    }
}

impl FakeResourceFetcher {
    /// Fetches always succeed with `content`.
    #[must_use]
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            metadata: Vec::new(),
            outcome: FetchOutcome::Fetched,
            fetched: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Fetched sources report `metadata`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<MetadataField>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The resource script exits with `status`.
    #[must_use]
    pub fn script_failing(mut self, status: i32) -> Self {
        self.outcome = FetchOutcome::ScriptFailed(status);
        self
    }

    /// Fetching fails with a worker error.
    #[must_use]
    pub fn erroring(mut self, msg: impl Into<String>) -> Self {
        self.outcome = FetchOutcome::Error(msg.into());
        self
    }

    /// Fetching blocks until cancelled.
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.outcome = FetchOutcome::BlockUntilCancelled;
        self
    }

    /// Every instance requested so far.
    #[must_use]
    pub fn fetched(&self) -> Vec<ResourceInstance> {
        self.fetched.lock().clone()
    }

    /// Every session requested so far.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl ResourceFetcher for FakeResourceFetcher {
    async fn fetch(
        &self,
        session: &Session,
        _resource_types: &ResourceTypes,
        instance: &ResourceInstance,
        _delegate: &dyn BuildStepDelegate,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn VersionedSource>> {
        self.fetched.lock().push(instance.clone());
        self.sessions.lock().push(session.clone());

        match &self.outcome {
            FetchOutcome::Fetched => Ok(Arc::new(
                FakeVersionedSource::new(self.content.clone())
                    .with_version(instance.version.clone())
                    .with_metadata(self.metadata.clone()),
            )),
            FetchOutcome::ScriptFailed(status) => Err(ExecError::ResourceScriptFailed {
                exit_status: *status,
                stderr: "script failed".to_string(),
            }),
            FetchOutcome::Error(msg) => Err(ExecError::worker(msg.clone())),
            FetchOutcome::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(ExecError::Interrupted)
            }
        }
    }
}
