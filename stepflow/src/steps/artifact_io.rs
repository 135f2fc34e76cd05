//! Steps bridging Run State rendezvous points and the artifact repository.
//!
//! An outside party (an upload endpoint, a download client) hands bytes to
//! or takes bytes from a running build through [`RunState::send_stream`] and
//! [`RunState::receive_stream`]. These steps make such bytes look like any
//! other artifact.

use crate::artifact::{read_all, ArtifactDestination, BlobSource, ByteStream};
use crate::cancellation::CancellationToken;
use crate::core::PlanId;
use crate::errors::{Result, UnknownArtifactSourceError};
use crate::state::RunState;
use crate::step::{ErrorReporter, Step, StepContext, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// Waits for an externally supplied stream and registers it as an artifact
/// under the step's name.
#[derive(Debug, Clone)]
pub struct ArtifactInputStep {
    ctx: StepContext,
}

impl ArtifactInputStep {
    /// Receives on the rendezvous point keyed by the context's plan id.
    #[must_use]
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

impl StepFactory for ArtifactInputStep {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(ErrorReporter::new(
            Box::new(ArtifactInput {
                ctx: self.ctx.clone(),
                state: Arc::clone(state),
                succeeded: None,
            }),
            Arc::clone(self.ctx.delegate()),
        ))
    }
}

struct ArtifactInput {
    ctx: StepContext,
    state: Arc<RunState>,
    succeeded: Option<bool>,
}

impl ArtifactInput {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        let stream = self.state.receive_stream(self.ctx.plan_id(), cancel).await?;
        let data = read_all(stream).await?;
        info!(bytes = data.len(), artifact = %self.ctx.name(), "received artifact");

        self.state
            .artifacts()
            .register_source(self.ctx.name(), Arc::new(BlobSource::new(data)));
        self.succeeded = Some(true);
        Ok(())
    }
}

#[async_trait]
impl Step for ArtifactInput {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let span = self.ctx.span().clone();
        self.execute(cancel).instrument(span).await
    }

    fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }
}

/// Streams a registered artifact to whoever receives on the step's
/// rendezvous point.
///
/// Every file the artifact streams is one handoff, in the order the artifact
/// streams them. With [`with_path`](Self::with_path) exactly one file is
/// handed over.
#[derive(Debug, Clone)]
pub struct ArtifactOutputStep {
    ctx: StepContext,
    artifact: String,
    path: Option<String>,
}

impl ArtifactOutputStep {
    /// Sends the artifact called `artifact` on the rendezvous point keyed by
    /// the context's plan id.
    #[must_use]
    pub fn new(ctx: StepContext, artifact: impl Into<String>) -> Self {
        Self {
            ctx,
            artifact: artifact.into(),
            path: None,
        }
    }

    /// Sends only the file at `path` inside the artifact.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl StepFactory for ArtifactOutputStep {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(ErrorReporter::new(
            Box::new(ArtifactOutput {
                step: self.clone(),
                state: Arc::clone(state),
                succeeded: None,
            }),
            Arc::clone(self.ctx.delegate()),
        ))
    }
}

struct ArtifactOutput {
    step: ArtifactOutputStep,
    state: Arc<RunState>,
    succeeded: Option<bool>,
}

/// Hands each streamed file to the rendezvous point for `plan_id`.
struct RendezvousDestination<'a> {
    state: &'a RunState,
    plan_id: &'a PlanId,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl ArtifactDestination for RendezvousDestination<'_> {
    async fn stream_in(&self, path: &str, stream: ByteStream) -> Result<()> {
        debug!(plan_id = %self.plan_id, path, "handing off artifact stream");
        self.state.send_stream(self.plan_id, stream, self.cancel).await
    }
}

impl ArtifactOutput {
    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        let name = &self.step.artifact;
        let source = self
            .state
            .artifacts()
            .source_for(name)
            .ok_or_else(|| UnknownArtifactSourceError::new(name))?;

        let dest = RendezvousDestination {
            state: &self.state,
            plan_id: self.step.ctx.plan_id(),
            cancel,
        };
        match &self.step.path {
            Some(path) => {
                let stream = source.stream_file(path).await?;
                dest.stream_in(path, stream).await?;
            }
            None => source.stream_to(&dest).await?,
        }

        info!(artifact = %name, "artifact handed off");
        self.succeeded = Some(true);
        Ok(())
    }
}

#[async_trait]
impl Step for ArtifactOutput {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let span = self.step.ctx.span().clone();
        self.execute(cancel).instrument(span).await
    }

    fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }
}
