//! Descriptions of containers and processes to create.

use crate::artifact::ArtifactSource;
use crate::core::PlanId;
use crate::events::OutputSink;
use std::sync::Arc;

/// Identifies who a container belongs to.
///
/// A step looking up its container after an orchestrator restart finds it
/// again through the same owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerOwner {
    /// The build the step belongs to.
    pub build_id: i64,
    /// The plan node the step executes.
    pub plan_id: PlanId,
    /// The team running the build.
    pub team_id: i64,
}

impl ContainerOwner {
    /// Creates a container owner.
    #[must_use]
    pub fn new(build_id: i64, plan_id: PlanId, team_id: i64) -> Self {
        Self {
            build_id,
            plan_id,
            team_id,
        }
    }
}

/// Where a container's root filesystem comes from.
#[derive(Clone, Default)]
pub enum ImageSpec {
    /// The worker's default image.
    #[default]
    Default,
    /// The image provided by a resource type the worker knows.
    ResourceType(String),
    /// An image URL, e.g. `docker:///busybox`.
    Url(String),
    /// An image fetched through a resource.
    Resource {
        /// Resource type.
        resource_type: String,
        /// Resource source configuration.
        source: serde_json::Value,
    },
    /// An image taken from an artifact produced earlier in the build.
    Artifact {
        /// The artifact name.
        name: String,
        /// The artifact itself.
        source: Arc<dyn ArtifactSource>,
    },
}

impl std::fmt::Debug for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::ResourceType(t) => f.debug_tuple("ResourceType").field(t).finish(),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Resource { resource_type, .. } => f
                .debug_struct("Resource")
                .field("resource_type", resource_type)
                .finish_non_exhaustive(),
            Self::Artifact { name, .. } => f
                .debug_struct("Artifact")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// An artifact to place in a container before it runs.
#[derive(Clone)]
pub struct InputSource {
    /// The name the step knows the input by.
    pub name: String,
    /// Absolute in-container path.
    pub destination_path: String,
    /// The content.
    pub source: Arc<dyn ArtifactSource>,
}

impl std::fmt::Debug for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSource")
            .field("name", &self.name)
            .field("destination_path", &self.destination_path)
            .finish_non_exhaustive()
    }
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Required worker platform, e.g. `linux`.
    pub platform: String,
    /// Required worker tags.
    pub tags: Vec<String>,
    /// The owning team.
    pub team_id: i64,
    /// Root filesystem.
    pub image: ImageSpec,
    /// Whether the container runs privileged.
    pub privileged: bool,
    /// Environment as `KEY=VALUE`.
    pub env: Vec<String>,
    /// Working directory.
    pub dir: String,
    /// Inputs to place before anything runs.
    pub inputs: Vec<InputSource>,
    /// Directories that get their own output volume.
    pub outputs: Vec<String>,
}

/// A process to start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable path.
    pub path: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE`.
    pub env: Vec<String>,
    /// Working directory.
    pub dir: String,
    /// User to run as.
    pub user: Option<String>,
}

/// The streams a process is wired to.
#[derive(Clone)]
pub struct ProcessIo {
    /// Bytes fed to stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Receives stdout.
    pub stdout: Arc<dyn OutputSink>,
    /// Receives stderr.
    pub stderr: Arc<dyn OutputSink>,
}

impl ProcessIo {
    /// Wires a process to `stdout` and `stderr` with no stdin.
    #[must_use]
    pub fn new(stdout: Arc<dyn OutputSink>, stderr: Arc<dyn OutputSink>) -> Self {
        Self {
            stdin: None,
            stdout,
            stderr,
        }
    }

    /// Feeds `stdin` to the process.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}
