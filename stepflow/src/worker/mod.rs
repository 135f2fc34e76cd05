//! The worker pool and container runtime, as consumed by steps.
//!
//! Placement, container lifecycle and the actual sandbox live behind these
//! traits. Steps only ever find or create a container for themselves, run or
//! re-attach to a process in it, and move bytes in and out.

mod spec;

pub use spec::{ContainerOwner, ContainerSpec, ImageSpec, InputSource, ProcessIo, ProcessSpec};

use crate::artifact::ByteStream;
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::events::BuildStepDelegate;
use crate::resource::ResourceTypes;
use async_trait::async_trait;
use std::sync::Arc;

/// A signal delivered to a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to shut down.
    Terminate,
    /// Kill the process outright.
    Kill,
}

/// A volume living on some worker.
pub trait Volume: Send + Sync {
    /// The volume's handle.
    fn handle(&self) -> &str;
}

/// A single worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// The worker's name.
    fn name(&self) -> &str;

    /// Looks up a volume on this worker by handle.
    async fn lookup_volume(&self, handle: &str) -> Result<Option<Arc<dyn Volume>>>;
}

/// A volume mounted into a container.
#[derive(Clone)]
pub struct VolumeMount {
    /// The mounted volume.
    pub volume: Arc<dyn Volume>,
    /// Where it is mounted, always ending in `/`.
    pub mount_path: String,
}

impl std::fmt::Debug for VolumeMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMount")
            .field("volume", &self.volume.handle())
            .field("mount_path", &self.mount_path)
            .finish()
    }
}

/// A process running in a container.
#[async_trait]
pub trait Process: Send + Sync {
    /// The process id, durable across orchestrator restarts.
    fn id(&self) -> String;

    /// Waits for the process to exit and returns its exit status.
    async fn wait(&self) -> Result<i32>;

    /// Delivers a signal to the process.
    async fn signal(&self, signal: Signal) -> Result<()>;
}

/// A container owned by one step of one build.
#[async_trait]
pub trait Container: Send + Sync {
    /// The container's handle.
    fn handle(&self) -> &str;

    /// Starts a new process.
    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Arc<dyn Process>>;

    /// Re-attaches to a process started earlier.
    async fn attach(&self, process_id: &str, io: ProcessIo) -> Result<Arc<dyn Process>>;

    /// Reads a durable property. `None` if it was never set.
    async fn property(&self, name: &str) -> Result<Option<String>>;

    /// Writes a durable property.
    async fn set_property(&self, name: &str, value: &str) -> Result<()>;

    /// The volumes mounted into the container.
    fn volume_mounts(&self) -> Vec<VolumeMount>;

    /// Stops every process in the container.
    async fn stop(&self, kill: bool) -> Result<()>;

    /// Streams a file or directory out of the container.
    async fn stream_out(&self, path: &str) -> Result<ByteStream>;

    /// Streams content into the container at `path`.
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()>;
}

/// The worker pool.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Finds the container `owner` already has, if any.
    async fn find_container(&self, owner: &ContainerOwner) -> Result<Option<Arc<dyn Container>>>;

    /// Finds or creates the container for `owner`, placing it on a worker
    /// that satisfies `spec`.
    async fn find_or_create_container(
        &self,
        cancel: &CancellationToken,
        delegate: &dyn BuildStepDelegate,
        owner: &ContainerOwner,
        spec: &ContainerSpec,
        resource_types: &ResourceTypes,
    ) -> Result<Arc<dyn Container>>;
}

/// Streams artifacts into a directory of a container.
pub struct ContainerDestination {
    container: Arc<dyn Container>,
    root: String,
}

impl ContainerDestination {
    /// Targets `root` inside `container`.
    #[must_use]
    pub fn new(container: Arc<dyn Container>, root: impl Into<String>) -> Self {
        Self {
            container,
            root: root.into(),
        }
    }
}

#[async_trait]
impl crate::artifact::ArtifactDestination for ContainerDestination {
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        let target = crate::artifact::join_path(&self.root, path);
        self.container.stream_in(&target, stream).await
    }
}
