//! Resources: external versioned things Get and Put steps fetch or publish.
//!
//! Running the resource scripts themselves is the fetcher's job. Steps only
//! describe what they want and adapt the result to the artifact contract.

mod fetched;
mod instance;

pub use fetched::FetchedArtifact;
pub use instance::{ResourceInstance, ResourceType, ResourceTypes};

use crate::artifact::ByteStream;
use crate::cancellation::CancellationToken;
use crate::core::{MetadataField, Version};
use crate::errors::Result;
use crate::events::BuildStepDelegate;
use crate::worker::Volume;
use async_trait::async_trait;
use std::sync::Arc;

/// Worker placement hints for a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Required worker tags.
    pub tags: Vec<String>,
    /// The owning team.
    pub team_id: i64,
    /// Environment exposed to the resource script as `KEY=VALUE`.
    pub env: Vec<String>,
}

/// A fetched resource version.
#[async_trait]
pub trait VersionedSource: Send + Sync {
    /// The version that was fetched.
    fn version(&self) -> Version;

    /// Metadata the resource reported.
    fn metadata(&self) -> Vec<MetadataField>;

    /// Streams a file or, for `"."`, the whole fetched directory.
    async fn stream_out(&self, path: &str) -> Result<ByteStream>;

    /// Streams content into the fetched directory.
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()>;

    /// The cache volume holding the fetched bits, if volumes are in use.
    fn volume(&self) -> Option<Arc<dyn Volume>>;
}

/// Fetches (possibly cached) resource versions.
///
/// A nonzero exit of the resource script is reported as
/// [`ExecError::ResourceScriptFailed`](crate::errors::ExecError::ResourceScriptFailed);
/// callers turn it into a failed outcome rather than an error.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetches `instance`, reusing a cached copy when one exists.
    async fn fetch(
        &self,
        session: &Session,
        resource_types: &ResourceTypes,
        instance: &ResourceInstance,
        delegate: &dyn BuildStepDelegate,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn VersionedSource>>;
}
