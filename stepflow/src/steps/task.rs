//! The task step: run a command in a container.

use super::task_config::{TaskConfig, TaskConfigSource};
use super::wait_or_stop;
use crate::artifact::{join_path, ContainerSource};
use crate::cancellation::{interruptible, CancellationToken};
use crate::config::ExecConfig;
use crate::core::ExitStatus;
use crate::errors::{ExecError, MissingInputsError, MissingTaskImageSourceError, Result};
use crate::resource::ResourceTypes;
use crate::state::RunState;
use crate::step::{ErrorReporter, Step, StepContext, StepFactory};
use crate::worker::{
    Container, ContainerOwner, ContainerSpec, ImageSpec, InputSource, Process, ProcessIo,
    ProcessSpec, WorkerClient,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, Instrument};

/// Container property holding the id of the running task process.
pub const TASK_PROCESS_PROPERTY: &str = "concourse:task-process";

/// Container property holding the exit status of a finished task.
pub const TASK_EXIT_STATUS_PROPERTY: &str = "concourse:exit-status";

/// Runs a task configuration in a container.
///
/// Inputs are taken from the artifact repository and outputs are registered
/// back into it once the process exits, or once it has been interrupted. The
/// exit status is persisted on the container so an orchestrator restarted
/// mid-task recovers it instead of running the task again.
#[derive(Clone)]
pub struct TaskStep {
    ctx: StepContext,
    config_source: Arc<dyn TaskConfigSource>,
    workers: Arc<dyn WorkerClient>,
    exec: ExecConfig,
    tags: Vec<String>,
    privileged: bool,
    resource_types: ResourceTypes,
    input_mapping: HashMap<String, String>,
    output_mapping: HashMap<String, String>,
    image_artifact: Option<String>,
}

impl TaskStep {
    /// Creates a task step.
    #[must_use]
    pub fn new(
        ctx: StepContext,
        config_source: Arc<dyn TaskConfigSource>,
        workers: Arc<dyn WorkerClient>,
    ) -> Self {
        Self {
            ctx,
            config_source,
            workers,
            exec: ExecConfig::default(),
            tags: Vec::new(),
            privileged: false,
            resource_types: ResourceTypes::new(),
            input_mapping: HashMap::new(),
            output_mapping: HashMap::new(),
            image_artifact: None,
        }
    }

    /// Sets the execution settings.
    #[must_use]
    pub fn with_config(mut self, exec: ExecConfig) -> Self {
        self.exec = exec;
        self
    }

    /// Requires workers with `tags`.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Runs the container privileged.
    #[must_use]
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Makes custom resource types available.
    #[must_use]
    pub fn with_resource_types(mut self, resource_types: ResourceTypes) -> Self {
        self.resource_types = resource_types;
        self
    }

    /// Maps task input names to artifact names.
    #[must_use]
    pub fn with_input_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.input_mapping = mapping;
        self
    }

    /// Maps task output names to the artifact names they register as.
    #[must_use]
    pub fn with_output_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.output_mapping = mapping;
        self
    }

    /// Uses the artifact `name` as the container image.
    #[must_use]
    pub fn with_image_artifact(mut self, name: impl Into<String>) -> Self {
        self.image_artifact = Some(name.into());
        self
    }
}

impl StepFactory for TaskStep {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        let delegate = Arc::clone(self.ctx.delegate());
        Box::new(ErrorReporter::new(
            Box::new(TaskAction {
                step: self.clone(),
                state: Arc::clone(state),
                container: None,
                exit_status: None,
            }),
            delegate,
        ))
    }
}

struct TaskAction {
    step: TaskStep,
    state: Arc<RunState>,
    container: Option<Arc<dyn Container>>,
    exit_status: Option<i32>,
}

impl TaskAction {
    fn owner(&self) -> ContainerOwner {
        let metadata = self.step.ctx.metadata();
        ContainerOwner::new(metadata.build_id, self.step.ctx.plan_id().clone(), metadata.team_id)
    }

    fn artifact_dir(&self, dir: &str) -> String {
        format!("{}/", join_path(&self.step.exec.artifacts_root, dir.trim_matches('/')))
    }

    fn inputs(&self, config: &TaskConfig) -> Result<Vec<InputSource>> {
        let repo = self.state.artifacts();
        let mut inputs = Vec::with_capacity(config.inputs.len());
        let mut missing = Vec::new();

        for input in &config.inputs {
            let name = self.step.input_mapping.get(&input.name).unwrap_or(&input.name);
            match repo.source_for(name) {
                Some(source) => inputs.push(InputSource {
                    name: input.name.clone(),
                    destination_path: join_path(&self.step.exec.artifacts_root, input.dir()),
                    source,
                }),
                None if input.optional => debug!(input = %name, "skipping absent optional input"),
                None => missing.push(name.clone()),
            }
        }

        if missing.is_empty() {
            Ok(inputs)
        } else {
            Err(MissingInputsError::new(missing).into())
        }
    }

    fn image(&self, config: &TaskConfig) -> Result<ImageSpec> {
        if let Some(name) = &self.step.image_artifact {
            let source = self
                .state
                .artifacts()
                .source_for(name)
                .ok_or_else(|| MissingTaskImageSourceError::new(name))?;
            return Ok(ImageSpec::Artifact {
                name: name.clone(),
                source,
            });
        }

        Ok(match (&config.image_resource, &config.image) {
            (Some(resource), _) => ImageSpec::Resource {
                resource_type: resource.resource_type.clone(),
                source: resource.source.clone(),
            },
            (None, Some(url)) => ImageSpec::Url(url.clone()),
            (None, None) => ImageSpec::Default,
        })
    }

    fn container_spec(&self, config: &TaskConfig) -> Result<ContainerSpec> {
        let inputs = self.inputs(config)?;
        let image = self.image(config)?;

        Ok(ContainerSpec {
            platform: config.platform.clone(),
            tags: self.step.tags.clone(),
            team_id: self.step.ctx.metadata().team_id,
            image,
            privileged: self.step.privileged,
            env: self.step.ctx.metadata().env(),
            dir: self.step.exec.artifacts_root.clone(),
            inputs,
            outputs: config.outputs.iter().map(|o| self.artifact_dir(o.dir())).collect(),
        })
    }

    fn process_spec(&self, config: &TaskConfig) -> ProcessSpec {
        ProcessSpec {
            path: config.run.path.clone(),
            args: config.run.args.clone(),
            env: config.params_env(),
            dir: join_path(&self.step.exec.artifacts_root, &config.run.dir),
            user: config.run.user.clone(),
        }
    }

    /// Registers every declared output as a source rooted at its mount.
    fn register_outputs(&self, config: &TaskConfig, container: &Arc<dyn Container>) {
        let repo = self.state.artifacts();
        let mounts = container.volume_mounts();

        for output in &config.outputs {
            let name = self
                .step
                .output_mapping
                .get(&output.name)
                .unwrap_or(&output.name);
            let path = self.artifact_dir(output.dir());

            if mounts.is_empty() {
                repo.register_source(name.clone(), Arc::new(ContainerSource::new(Arc::clone(container), path)));
                continue;
            }

            for mount in mounts.iter().filter(|m| m.mount_path == path) {
                let source = ContainerSource::new(Arc::clone(container), path.clone())
                    .with_volume_handle(mount.volume.handle());
                repo.register_source(name.clone(), Arc::new(source));
            }
        }
    }

    fn record_exit(&mut self, status: i32) {
        self.exit_status = Some(status);
        self.state.store_result(self.step.ctx.plan_id(), ExitStatus(status));
    }

    /// Recovers from an existing container: either the task already exited,
    /// or its process is re-attached.
    async fn resume(
        &mut self,
        container: Arc<dyn Container>,
        config: &TaskConfig,
        io: ProcessIo,
    ) -> Result<Option<Arc<dyn Process>>> {
        if let Some(status) = container.property(TASK_EXIT_STATUS_PROPERTY).await? {
            let status: i32 = status.trim().parse().map_err(|e| {
                ExecError::worker(format!("invalid exit status property '{status}': {e}"))
            })?;
            info!(exit_status = status, "task already exited");
            self.register_outputs(config, &container);
            self.record_exit(status);
            return Ok(None);
        }

        let process_id = container
            .property(TASK_PROCESS_PROPERTY)
            .await?
            .ok_or_else(|| ExecError::worker(format!("container {} has no task process", container.handle())))?;

        info!(process_id = %process_id, "re-attaching to running task");
        container.attach(&process_id, io).await.map(Some)
    }

    async fn start(
        &mut self,
        config: &TaskConfig,
        io: ProcessIo,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Process>> {
        let delegate = Arc::clone(self.step.ctx.delegate());
        delegate.initializing();

        let spec = self.container_spec(config)?;
        let owner = self.owner();
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
        let process = container.run(self.process_spec(config), io).await?;
        container.set_property(TASK_PROCESS_PROPERTY, &process.id()).await?;
        debug!(process_id = %process.id(), "task process started");
        Ok(process)
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        let config = interruptible(cancel, self.step.config_source.fetch_config(self.state.artifacts())).await?;

        let delegate = Arc::clone(self.step.ctx.delegate());
        let io = ProcessIo::new(delegate.stdout(), delegate.stderr());

        let existing = self.step.workers.find_container(&self.owner()).await?;
        let process = match existing {
            Some(container) => {
                self.container = Some(Arc::clone(&container));
                match self.resume(container, &config, io).await? {
                    Some(process) => process,
                    None => return Ok(()),
                }
            }
            None => self.start(&config, io, cancel).await?,
        };

        let Some(container) = self.container.clone() else {
            return Err(ExecError::internal("task process has no container"));
        };

        match wait_or_stop(process.as_ref(), cancel, self.step.exec.sigterm_grace()).await {
            Ok(status) => {
                self.register_outputs(&config, &container);
                container
                    .set_property(TASK_EXIT_STATUS_PROPERTY, &status.to_string())
                    .await?;
                self.record_exit(status);
                info!(exit_status = status, "task exited");
                delegate.completed(ExitStatus(status), None);
                Ok(())
            }
            Err(err) => {
                if err.is_interrupted() {
                    self.register_outputs(&config, &container);
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Step for TaskAction {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let span = self.step.ctx.span().clone();
        self.execute(cancel).instrument(span).await
    }

    fn succeeded(&self) -> Option<bool> {
        self.exit_status.map(|status| status == 0)
    }

    async fn release(&mut self) -> Result<()> {
        self.container = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::read_all;
    use crate::core::PlanId;
    use crate::events::CollectingDelegate;
    use crate::steps::task_config::{StaticConfigSource, TaskInput, TaskOutput};
    use crate::testing::{FakeContainer, FakeProcess, FakeWorkerClient, InMemorySource, ProcessScript};
    use crate::worker::Signal;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> TaskConfig {
        TaskConfig {
            platform: "linux".to_string(),
            run: crate::steps::RunConfig {
                path: "make".to_string(),
                args: vec!["test".to_string()],
                ..Default::default()
            },
            inputs: vec![TaskInput::new("repo")],
            outputs: vec![TaskOutput::new("built")],
            ..TaskConfig::default()
        }
    }

    struct Fixture {
        workers: Arc<FakeWorkerClient>,
        delegate: Arc<CollectingDelegate>,
        state: Arc<RunState>,
    }

    impl Fixture {
        fn new(script: ProcessScript) -> Self {
            let state = Arc::new(RunState::new());
            state
                .artifacts()
                .register_source("repo", Arc::new(InMemorySource::from_files(&[("Makefile", "test:")])));
            Self {
                workers: Arc::new(FakeWorkerClient::new().with_script(script)),
                delegate: Arc::new(CollectingDelegate::new()),
                state,
            }
        }

        fn step(&self, config: TaskConfig) -> TaskStep {
            let ctx = StepContext::new(PlanId::new("task-1"), "unit")
                .with_delegate(self.delegate.clone());
            TaskStep::new(ctx, Arc::new(StaticConfigSource::new(config)), self.workers.clone())
        }

        fn owner() -> ContainerOwner {
            ContainerOwner::new(0, PlanId::new("task-1"), 0)
        }
    }

    #[tokio::test]
    async fn test_runs_task_and_registers_outputs() {
        let fixture = Fixture::new(
            ProcessScript::exiting(0).with_file("/tmp/build/exec/built/out.txt", "artifact"),
        );
        let mut step = fixture.step(config()).using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(true));

        let container = fixture.workers.container_for(&Fixture::owner()).unwrap();
        assert_eq!(container.file("/tmp/build/exec/repo/Makefile"), Some(b"test:".to_vec()));

        let runs = container.runs();
        let (spec, _) = &runs[0];
        assert_eq!(spec.path, "make");
        assert_eq!(spec.dir, "/tmp/build/exec");

        let built = fixture.state.artifacts().source_for("built").unwrap();
        let data = read_all(built.stream_file("out.txt").await.unwrap()).await.unwrap();
        assert_eq!(data, b"artifact");

        assert_eq!(container.property_value(TASK_EXIT_STATUS_PROPERTY).as_deref(), Some("0"));
        assert_eq!(fixture.state.result::<ExitStatus>(&PlanId::new("task-1")), Some(ExitStatus(0)));
        assert_eq!(
            fixture.delegate.kinds(),
            vec!["step.initializing", "step.started", "step.completed"]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_not_error() {
        let fixture = Fixture::new(ProcessScript::exiting(2));
        let mut step = fixture.step(config()).using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(step.succeeded(), Some(false));
        assert_eq!(fixture.state.result::<ExitStatus>(&PlanId::new("task-1")), Some(ExitStatus(2)));
    }

    #[tokio::test]
    async fn test_every_missing_input_is_reported() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let mut config = config();
        config.inputs = vec![
            TaskInput::new("repo"),
            TaskInput::new("a"),
            TaskInput::new("b"),
            TaskInput::new("c").optional(),
        ];
        let mut step = fixture.step(config).using(&fixture.state);

        let err = step.run(&CancellationToken::new()).await.unwrap_err();

        match err {
            ExecError::MissingInputs(e) => assert_eq!(e.inputs, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fixture.delegate.kinds(), vec!["step.initializing", "step.failed"]);
    }

    #[tokio::test]
    async fn test_input_and_output_mapping() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let mut config = config();
        config.inputs = vec![TaskInput::new("source-code").with_path("src")];
        let step = fixture
            .step(config)
            .with_input_mapping(HashMap::from([("source-code".to_string(), "repo".to_string())]))
            .with_output_mapping(HashMap::from([("built".to_string(), "binary".to_string())]));

        let mut live = step.using(&fixture.state);
        live.run(&CancellationToken::new()).await.unwrap();

        let container = fixture.workers.container_for(&Fixture::owner()).unwrap();
        assert_eq!(container.file("/tmp/build/exec/src/Makefile"), Some(b"test:".to_vec()));
        assert!(fixture.state.artifacts().source_for("binary").is_some());
        assert!(fixture.state.artifacts().source_for("built").is_none());
    }

    #[tokio::test]
    async fn test_missing_image_artifact() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let mut step = fixture.step(config()).with_image_artifact("rootfs").using(&fixture.state);

        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecError::MissingTaskImageSource(_)));
    }

    #[tokio::test]
    async fn test_params_become_process_env() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let mut config = config();
        config.params.insert("FOO".to_string(), serde_json::json!("bar"));
        let mut step = fixture.step(config).with_privileged(true).using(&fixture.state);

        step.run(&CancellationToken::new()).await.unwrap();

        let container = fixture.workers.container_for(&Fixture::owner()).unwrap();
        assert_eq!(container.runs()[0].0.env, vec!["FOO=bar"]);
        assert!(fixture.workers.specs()[0].privileged);
    }

    #[tokio::test]
    async fn test_recovers_exit_status_without_rerunning() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let container = Arc::new(FakeContainer::new("existing"));
        container.put_property(TASK_EXIT_STATUS_PROPERTY, "1");
        fixture.workers.insert_container(Fixture::owner(), Arc::clone(&container));

        let mut step = fixture.step(config()).using(&fixture.state);
        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(step.succeeded(), Some(false));
        assert!(container.runs().is_empty());
        assert!(fixture.state.artifacts().source_for("built").is_some());
        assert!(!fixture.delegate.kinds().contains(&"step.initializing".to_string()));
    }

    #[tokio::test]
    async fn test_reattaches_to_running_process() {
        let fixture = Fixture::new(ProcessScript::exiting(0));
        let container = Arc::new(FakeContainer::new("existing"));
        let process = Arc::new(FakeProcess::new("proc-1", &ProcessScript::exiting(0)));
        container.add_process(process);
        container.put_property(TASK_PROCESS_PROPERTY, "proc-1");
        fixture.workers.insert_container(Fixture::owner(), Arc::clone(&container));

        let mut step = fixture.step(config()).using(&fixture.state);
        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(container.attached(), vec!["proc-1"]);
        assert!(container.runs().is_empty());
        assert_eq!(container.property_value(TASK_EXIT_STATUS_PROPERTY).as_deref(), Some("0"));
        assert_eq!(step.succeeded(), Some(true));
    }

    #[tokio::test]
    async fn test_interrupt_terminates_and_registers_outputs() {
        let fixture = Fixture::new(ProcessScript::blocking().ignoring_terminate());
        let step = fixture
            .step(config())
            .with_config(ExecConfig::new().with_sigterm_grace(Duration::from_millis(10)));
        let mut live = step.using(&fixture.state);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel("abort");
        });

        let err = live.run(&cancel).await.unwrap_err();
        assert!(err.is_interrupted());

        let container = fixture.workers.container_for(&Fixture::owner()).unwrap();
        let process_id = container.property_value(TASK_PROCESS_PROPERTY).unwrap();
        let process = container.process(&process_id).unwrap();
        assert_eq!(process.signals(), vec![Signal::Terminate, Signal::Kill]);

        assert!(fixture.state.artifacts().source_for("built").is_some());
        assert_eq!(live.succeeded(), None);
        assert!(fixture.delegate.kinds().iter().all(|k| k != "step.failed"));
    }
}
