//! Compiles a [`Plan`] into a tree of step factories.

use super::{parse_duration, GetPlan, HookPlan, HookedPlan, Plan, PlanStep, PutPlan, TaskPlan};
use crate::combinators::{
    Aggregate, Ensure, HookedCompose, Identity, OnAbort, OnFailure, OnSuccess, Retry, Timeout, Try,
};
use crate::config::ExecConfig;
use crate::core::PlanId;
use crate::creds::{StaticVariables, Variables};
use crate::errors::{ExecError, Result};
use crate::events::{BuildStepDelegate, NoOpDelegate};
use crate::resource::ResourceFetcher;
use crate::step::{StepContext, StepFactory, StepMetadata, SuccessReporter};
use crate::steps::{
    ArtifactInputStep, ArtifactOutputStep, FileConfigSource, GetStep, MergedConfigSource, PutInputs, PutStep,
    StaticConfigSource, TaskConfig, TaskConfigSource, TaskStep, ValidatingConfigSource, VersionSource,
};
use crate::worker::WorkerClient;
use std::sync::Arc;
use tracing::{debug, Span};

/// Produces the delegate a primitive step reports to, given its plan id and
/// name.
pub type DelegateFactory = Arc<dyn Fn(&PlanId, &str) -> Arc<dyn BuildStepDelegate> + Send + Sync>;

/// Compiles plans using one build's collaborators.
#[derive(Clone)]
pub struct StepBuilder {
    workers: Arc<dyn WorkerClient>,
    fetcher: Arc<dyn ResourceFetcher>,
    variables: Arc<dyn Variables>,
    exec: ExecConfig,
    metadata: StepMetadata,
    delegates: DelegateFactory,
    reporter: Option<SuccessReporter>,
    span: Span,
}

impl StepBuilder {
    /// Creates a builder over a worker pool and resource fetcher.
    #[must_use]
    pub fn new(workers: Arc<dyn WorkerClient>, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self {
            workers,
            fetcher,
            variables: Arc::new(StaticVariables::new()),
            exec: ExecConfig::default(),
            metadata: StepMetadata::default(),
            delegates: Arc::new(|_: &PlanId, _: &str| Arc::new(NoOpDelegate) as Arc<dyn BuildStepDelegate>),
            reporter: None,
            span: Span::current(),
        }
    }

    /// Sets the credential lookup for get and put steps.
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

    /// Sets the build metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets how each primitive step's delegate is obtained.
    #[must_use]
    pub fn with_delegates(mut self, delegates: DelegateFactory) -> Self {
        self.delegates = delegates;
        self
    }

    /// Subjects every primitive step to `reporter`.
    #[must_use]
    pub fn with_success_reporter(mut self, reporter: SuccessReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Parents every step span under `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Compiles `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::InvalidPlan`] for nodes that cannot be compiled.
    pub fn build(&self, plan: &Plan) -> Result<Arc<dyn StepFactory>> {
        debug!(plan_id = %plan.id, "compiling plan node");
        Ok(match &plan.step {
            PlanStep::Get(get) => self.primitive(self.get(&plan.id, get)?),
            PlanStep::Put(put) => self.primitive(Arc::new(self.put(&plan.id, put))),
            PlanStep::Task(task) => self.primitive(Arc::new(self.task(&plan.id, task)?)),
            PlanStep::Do(children) => self.sequence(children)?,
            PlanStep::Aggregate(children) => {
                let mut aggregate = Aggregate::new();
                for child in children {
                    aggregate = aggregate.with_branch(child.id.to_string(), self.build(child)?);
                }
                Arc::new(aggregate)
            }
            PlanStep::Retry(attempts) => {
                if attempts.is_empty() {
                    return Err(ExecError::invalid_plan(&plan.id, "retry needs at least one attempt"));
                }
                let attempts = attempts.iter().map(|a| self.build(a)).collect::<Result<Vec<_>>>()?;
                Arc::new(Retry::new(attempts))
            }
            PlanStep::Timeout(timeout) => {
                let duration = parse_duration(&timeout.duration).ok_or_else(|| {
                    ExecError::invalid_plan(&plan.id, format!("invalid duration '{}'", timeout.duration))
                })?;
                Arc::new(Timeout::new(self.build(&timeout.step)?, duration))
            }
            PlanStep::OnSuccess(HookPlan { step, hook }) => {
                Arc::new(OnSuccess::new(self.build(step)?, self.build(hook)?))
            }
            PlanStep::OnFailure(HookPlan { step, hook }) => {
                Arc::new(OnFailure::new(self.build(step)?, self.build(hook)?))
            }
            PlanStep::OnAbort(HookPlan { step, hook }) => {
                Arc::new(OnAbort::new(self.build(step)?, self.build(hook)?))
            }
            PlanStep::Ensure(HookPlan { step, hook }) => {
                Arc::new(Ensure::new(self.build(step)?, self.build(hook)?))
            }
            PlanStep::Try(step) => Arc::new(Try::new(self.build(step)?)),
            PlanStep::Hooked(hooked) => self.hooked(hooked)?,
            PlanStep::ArtifactInput(input) => {
                Arc::new(ArtifactInputStep::new(self.context(&plan.id, &input.name)))
            }
            PlanStep::ArtifactOutput(output) => {
                let mut step = ArtifactOutputStep::new(self.context(&plan.id, &output.artifact), &output.artifact);
                if let Some(path) = &output.path {
                    step = step.with_path(path);
                }
                Arc::new(step)
            }
        })
    }

    fn context(&self, plan_id: &PlanId, name: &str) -> StepContext {
        StepContext::new(plan_id.clone(), name)
            .with_parent_span(&self.span)
            .with_delegate((self.delegates)(plan_id, name))
            .with_metadata(self.metadata.clone())
    }

    fn primitive(&self, factory: Arc<dyn StepFactory>) -> Arc<dyn StepFactory> {
        match &self.reporter {
            Some(reporter) => reporter.subject(factory),
            None => factory,
        }
    }

    /// Folds `children` into an [`OnSuccess`] chain ending in [`Identity`],
    /// so a child that fails or errors stops the rest of the sequence.
    fn sequence(&self, children: &[Plan]) -> Result<Arc<dyn StepFactory>> {
        let compiled = children
            .iter()
            .map(|child| self.build(child))
            .collect::<Result<Vec<_>>>()?;

        Ok(compiled
            .into_iter()
            .rev()
            .fold(Identity::shared(), |tail, head| Arc::new(OnSuccess::new(head, tail))))
    }

    fn hooked(&self, hooked: &HookedPlan) -> Result<Arc<dyn StepFactory>> {
        let next = match hooked.next.as_deref() {
            Some(plan) => self.build(plan)?,
            None => Identity::shared(),
        };

        let mut compose = HookedCompose::new(self.build(&hooked.step)?, next);
        if let Some(plan) = hooked.on_success.as_deref() {
            compose = compose.with_on_success(self.build(plan)?);
        }
        if let Some(plan) = hooked.on_failure.as_deref() {
            compose = compose.with_on_failure(self.build(plan)?);
        }
        if let Some(plan) = hooked.ensure.as_deref() {
            compose = compose.with_ensure(self.build(plan)?);
        }
        Ok(Arc::new(compose))
    }

    fn get(&self, plan_id: &PlanId, get: &GetPlan) -> Result<Arc<dyn StepFactory>> {
        let version = match (&get.version_from, &get.version) {
            (Some(put_id), _) => VersionSource::FromPut(put_id.clone()),
            (None, Some(version)) => VersionSource::Pinned(version.clone()),
            (None, None) => {
                return Err(ExecError::invalid_plan(plan_id, "get needs a version or version_from"));
            }
        };

        Ok(Arc::new(
            GetStep::new(self.context(plan_id, &get.name), Arc::clone(&self.fetcher), &get.resource_type, version)
                .with_source(get.source.clone())
                .with_params(get.params.clone())
                .with_variables(Arc::clone(&self.variables))
                .with_tags(get.tags.clone())
                .with_resource_types(get.resource_types.clone()),
        ))
    }

    fn put(&self, plan_id: &PlanId, put: &PutPlan) -> PutStep {
        let inputs = put.inputs.clone().map_or(PutInputs::All, PutInputs::Only);

        PutStep::new(self.context(plan_id, &put.name), Arc::clone(&self.workers), &put.resource_type)
            .with_source(put.source.clone())
            .with_params(put.params.clone())
            .with_variables(Arc::clone(&self.variables))
            .with_config(self.exec.clone())
            .with_inputs(inputs)
            .with_tags(put.tags.clone())
            .with_resource_types(put.resource_types.clone())
    }

    fn task(&self, plan_id: &PlanId, task: &TaskPlan) -> Result<TaskStep> {
        let config_source: Arc<dyn TaskConfigSource> = match (&task.config_path, &task.config) {
            (Some(path), config) => Arc::new(MergedConfigSource::new(
                Arc::new(FileConfigSource::new(path)),
                Arc::new(
                    StaticConfigSource::new(config.clone().unwrap_or_default())
                        .with_params(task.params.clone()),
                ),
            )),
            (None, Some(config)) => {
                Arc::new(StaticConfigSource::new(config.clone()).with_params(task.params.clone()))
            }
            (None, None) => {
                return Err(ExecError::invalid_plan(plan_id, "task needs a config or config_path"));
            }
        };

        let mut step = TaskStep::new(
            self.context(plan_id, &task.name),
            Arc::new(ValidatingConfigSource::new(config_source)),
            Arc::clone(&self.workers),
        )
        .with_config(self.exec.clone())
        .with_tags(task.tags.clone())
        .with_privileged(task.privileged)
        .with_resource_types(task.resource_types.clone())
        .with_input_mapping(task.input_mapping.clone())
        .with_output_mapping(task.output_mapping.clone());

        if let Some(image) = &task.image {
            step = step.with_image_artifact(image);
        }
        Ok(step)
    }
}

impl std::fmt::Debug for StepBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepBuilder")
            .field("exec", &self.exec)
            .field("metadata", &self.metadata)
            .field("reporting", &self.reporter.is_some())
            .finish_non_exhaustive()
    }
}
