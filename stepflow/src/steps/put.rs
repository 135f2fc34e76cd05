//! The put step: publish artifacts through a resource.

use super::wait_or_stop;
use crate::artifact::ArtifactSource;
use crate::cancellation::{interruptible, CancellationToken};
use crate::config::ExecConfig;
use crate::core::{ExitStatus, VersionInfo};
use crate::creds::{self, StaticVariables, Variables};
use crate::errors::{ExecError, Result};
use crate::events::BufferSink;
use crate::resource::ResourceTypes;
use crate::state::RunState;
use crate::step::{ErrorReporter, Step, StepContext, StepFactory};
use crate::worker::{Container, ContainerOwner, ContainerSpec, ImageSpec, InputSource, ProcessIo, ProcessSpec, WorkerClient};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

/// Which artifacts a put step hands to its resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PutInputs {
    /// Every artifact registered when the step starts.
    #[default]
    All,
    /// Only the named artifacts. Naming an unregistered one is an error.
    Only(Vec<String>),
}

/// Runs a resource's `out` script and captures the version it produced.
///
/// The chosen artifacts are placed under the artifacts root, one
/// subdirectory per artifact name. The script receives `{source, params}`
/// on stdin and must print `{version, metadata}` on stdout.
#[derive(Clone)]
pub struct PutStep {
    ctx: StepContext,
    workers: Arc<dyn WorkerClient>,
    variables: Arc<dyn Variables>,
    exec: ExecConfig,
    resource_type: String,
    source: Value,
    params: Value,
    inputs: PutInputs,
    tags: Vec<String>,
    resource_types: ResourceTypes,
}

impl PutStep {
    /// Creates a put step for `resource_type`.
    #[must_use]
    pub fn new(ctx: StepContext, workers: Arc<dyn WorkerClient>, resource_type: impl Into<String>) -> Self {
        Self {
            ctx,
            workers,
            variables: Arc::new(StaticVariables::new()),
            exec: ExecConfig::default(),
            resource_type: resource_type.into(),
            source: Value::Object(serde_json::Map::new()),
            params: Value::Object(serde_json::Map::new()),
            inputs: PutInputs::All,
            tags: Vec::new(),
            resource_types: ResourceTypes::new(),
        }
    }

    /// Sets the (templated) resource source configuration.
    #[must_use]
    pub fn with_source(mut self, source: Value) -> Self {
        self.source = source;
        self
    }

    /// Sets the (templated) put params.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Resolves `((placeholders))` against `variables`.
    #[must_use]
    pub fn with_variables(mut self, variables: Arc<dyn Variables>) -> Self {
        self.variables = variables;
        self
    }

    /// Sets the execution settings.
    #[must_use]
    pub fn with_config(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    /// Restricts which artifacts are handed to the resource.
    #[must_use]
    pub fn with_inputs(mut self, inputs: PutInputs) -> Self {
        self.inputs = inputs;
        self
    }

    /// Requires workers with `tags`.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Makes custom resource types available.
    #[must_use]
    pub fn with_resource_types(mut self, resource_types: ResourceTypes) -> Self {
        self.resource_types = resource_types;
        self
    }
}

impl StepFactory for PutStep {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        let delegate = Arc::clone(self.ctx.delegate());
        Box::new(ErrorReporter::new(
            Box::new(PutAction {
                step: self.clone(),
                state: Arc::clone(state),
                container: None,
                succeeded: None,
            }),
            delegate,
        ))
    }
}

struct PutAction {
    step: PutStep,
    state: Arc<RunState>,
    container: Option<Arc<dyn Container>>,
    succeeded: Option<bool>,
}

impl PutAction {
    fn input_source(&self) -> Result<Arc<dyn ArtifactSource>> {
        let repo = self.state.artifacts();
        let source: Arc<dyn ArtifactSource> = match &self.step.inputs {
            PutInputs::All => Arc::new(repo.snapshot()),
            PutInputs::Only(names) => Arc::new(repo.scoped_to(names.as_slice())?),
        };
        Ok(source)
    }

    fn container_spec(&self) -> Result<ContainerSpec> {
        let metadata = self.step.ctx.metadata();
        Ok(ContainerSpec {
            tags: self.step.tags.clone(),
            team_id: metadata.team_id,
            image: ImageSpec::ResourceType(self.step.resource_type.clone()),
            env: metadata.env(),
            dir: self.step.exec.artifacts_root.clone(),
            inputs: vec![InputSource {
                name: "inputs".to_string(),
                destination_path: self.step.exec.artifacts_root.clone(),
                source: self.input_source()?,
            }],
            ..ContainerSpec::default()
        })
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        let ctx = self.step.ctx.clone();
        let delegate = Arc::clone(ctx.delegate());
        delegate.initializing();

        let source = creds::evaluate(&self.step.source, self.step.variables.as_ref())?;
        let params = creds::evaluate(&self.step.params, self.step.variables.as_ref())?;

        let spec = self.container_spec()?;
        let metadata = ctx.metadata();
        let owner = ContainerOwner::new(metadata.build_id, ctx.plan_id().clone(), metadata.team_id);
        let container = interruptible(
            cancel,
            self.step.workers.find_or_create_container(
                cancel,
                delegate.as_ref(),
                &owner,
                &spec,
                &self.step.resource_types,
            ),
        )
        .await?;
        self.container = Some(Arc::clone(&container));

        delegate.started();
        let stdout = Arc::new(BufferSink::new());
        let request = serde_json::to_vec(&json!({ "source": source, "params": params }))?;
        let io = ProcessIo::new(stdout.clone(), delegate.stderr()).with_stdin(request);
        let process = container
            .run(
                ProcessSpec {
                    path: self.step.exec.resource_out_path.clone(),
                    args: vec![self.step.exec.artifacts_root.clone()],
                    dir: self.step.exec.artifacts_root.clone(),
                    ..ProcessSpec::default()
                },
                io,
            )
            .await?;
        debug!(process_id = %process.id(), "resource out script started");

        let status = wait_or_stop(process.as_ref(), cancel, self.step.exec.sigterm_grace()).await?;
        if status != 0 {
            warn!(exit_status = status, resource_type = %self.step.resource_type, "resource out script failed");
            delegate.completed(ExitStatus(status), None);
            self.succeeded = Some(false);
            return Ok(());
        }

        let info: VersionInfo = serde_json::from_slice(&stdout.contents()).map_err(|e| {
            ExecError::Serialization(format!("invalid output from resource out script: {e}"))
        })?;
        info!(version = ?info.version, "put resource version");

        self.state.store_result(ctx.plan_id(), info.clone());
        delegate.completed(ExitStatus(0), Some(&info));
        self.succeeded = Some(true);
        Ok(())
    }
}

#[async_trait]
impl Step for PutAction {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let span = self.step.ctx.span().clone();
        self.execute(cancel).instrument(span).await
    }

    fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }

    async fn release(&mut self) -> Result<()> {
        self.container = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlanId, Version};
    use crate::errors::UnknownArtifactSourceError;
    use crate::events::CollectingDelegate;
    use crate::testing::{FakeWorkerClient, InMemorySource, ProcessScript};
    use crate::worker::Signal;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const OUTPUT: &str = r#"{"version":{"ref":"v2"},"metadata":[{"name":"commit","value":"abc"}]}"#;

    struct Fixture {
        workers: Arc<FakeWorkerClient>,
        delegate: Arc<CollectingDelegate>,
        state: Arc<RunState>,
    }

    impl Fixture {
        fn new(script: ProcessScript) -> Self {
            let state = Arc::new(RunState::new());
            let repo = state.artifacts();
            repo.register_source("a", Arc::new(InMemorySource::from_files(&[("file", "A")])));
            repo.register_source("b", Arc::new(InMemorySource::from_files(&[("file", "B")])));
            Self {
                workers: Arc::new(FakeWorkerClient::new().with_script(script)),
                delegate: Arc::new(CollectingDelegate::new()),
                state,
            }
        }

        fn step(&self) -> PutStep {
            let ctx = StepContext::new(PlanId::new("put-1"), "release").with_delegate(self.delegate.clone());
            PutStep::new(ctx, self.workers.clone(), "git")
        }

        fn container(&self) -> Arc<crate::testing::FakeContainer> {
            self.workers
                .container_for(&ContainerOwner::new(0, PlanId::new("put-1"), 0))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_puts_every_artifact_and_stores_version() {
        let fixture = Fixture::new(ProcessScript::exiting(0).with_stdout(OUTPUT));
        let mut step = fixture
            .step()
            .with_source(serde_json::json!({"uri": "x"}))
            .with_params(serde_json::json!({"tag": "v2"}))
            .using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(true));

        let container = fixture.container();
        assert_eq!(container.file("/tmp/build/exec/a/file"), Some(b"A".to_vec()));
        assert_eq!(container.file("/tmp/build/exec/b/file"), Some(b"B".to_vec()));

        let runs = container.runs();
        let (spec, stdin) = &runs[0];
        assert_eq!(spec.path, "/opt/resource/out");
        assert_eq!(spec.args, vec!["/tmp/build/exec".to_string()]);
        let request: Value = serde_json::from_slice(stdin.as_deref().unwrap()).unwrap();
        assert_eq!(request, serde_json::json!({"source": {"uri": "x"}, "params": {"tag": "v2"}}));

        let specs = fixture.workers.specs();
        assert!(matches!(&specs[0].image, ImageSpec::ResourceType(t) if t == "git"));

        let info = fixture.state.result::<VersionInfo>(&PlanId::new("put-1")).unwrap();
        assert_eq!(info.version, Version::from([("ref".to_string(), "v2".to_string())]));
        assert_eq!(info.metadata[0].value, "abc");
        assert_eq!(
            fixture.delegate.kinds(),
            vec!["step.initializing", "step.started", "step.completed"]
        );
    }

    #[tokio::test]
    async fn test_inputs_are_fixed_when_container_is_created() {
        let fixture = Fixture::new(ProcessScript::exiting(0).with_stdout(OUTPUT));
        let mut step = fixture.step().using(&fixture.state);
        step.run(&CancellationToken::new()).await.unwrap();

        fixture
            .state
            .artifacts()
            .register_source("late", Arc::new(InMemorySource::from_files(&[("file", "L")])));

        let specs = fixture.workers.specs();
        let inputs = &specs[0].inputs[0].source;
        assert!(inputs.stream_file("a/file").await.is_ok());
        assert!(inputs.stream_file("late/file").await.is_err());
    }

    #[tokio::test]
    async fn test_scoped_inputs() {
        let fixture = Fixture::new(ProcessScript::exiting(0).with_stdout(OUTPUT));
        let mut step = fixture
            .step()
            .with_inputs(PutInputs::Only(vec!["b".to_string()]))
            .using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();

        let container = fixture.container();
        assert_eq!(container.file("/tmp/build/exec/a/file"), None);
        assert_eq!(container.file("/tmp/build/exec/b/file"), Some(b"B".to_vec()));
    }

    #[tokio::test]
    async fn test_scoping_to_unknown_artifact_errors() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let mut step = fixture
            .step()
            .with_inputs(PutInputs::Only(vec!["nope".to_string()]))
            .using(&fixture.state);

        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownArtifactSource(UnknownArtifactSourceError { ref name }) if name == "nope"));
        assert_eq!(fixture.delegate.events_of_kind("step.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_script_failure_is_failed_outcome() {
        let fixture = Fixture::new(ProcessScript::exiting(1));
        let mut step = fixture.step().using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(step.succeeded(), Some(false));
        assert!(fixture.state.result::<VersionInfo>(&PlanId::new("put-1")).is_none());
        let completed = fixture.delegate.events_of_kind("step.completed");
        assert_eq!(completed[0].data.as_ref().unwrap()["exit_status"], serde_json::json!(1));
        assert!(fixture.delegate.events_of_kind("step.failed").is_empty());
    }

    #[tokio::test]
    async fn test_container_error_is_reported() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let workers = Arc::new(FakeWorkerClient::new().failing("no workers"));
        let ctx = StepContext::new(PlanId::new("put-1"), "release").with_delegate(fixture.delegate.clone());
        let mut step = PutStep::new(ctx, workers, "git").using(&fixture.state);

        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no workers"));
        assert_eq!(step.succeeded(), None);
        assert_eq!(fixture.delegate.events_of_kind("step.failed").len(), 1);
        assert!(fixture.delegate.events_of_kind("step.completed").is_empty());
    }

    #[tokio::test]
    async fn test_garbage_output_is_an_error() {
        let fixture = Fixture::new(ProcessScript::exiting(0).with_stdout("not json"));
        let mut step = fixture.step().using(&fixture.state);

        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_interrupt_stops_script() {
        let fixture = Fixture::new(ProcessScript::blocking());
        let mut step = fixture
            .step()
            .with_config(ExecConfig::default().with_sigterm_grace(Duration::from_millis(50)))
            .using(&fixture.state);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel("abort");
        });

        let err = step.run(&cancel).await.unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(step.succeeded(), None);
        assert!(fixture.delegate.events_of_kind("step.failed").is_empty());

        let container = fixture.container();
        let runs = container.runs();
        assert_eq!(runs.len(), 1);
        let process = container.processes().pop().unwrap();
        assert_eq!(process.signals(), vec![Signal::Terminate]);
    }
}
