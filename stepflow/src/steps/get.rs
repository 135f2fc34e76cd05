//! The get step: fetch a resource version.

use crate::cancellation::{interruptible, CancellationToken};
use crate::core::{ExitStatus, PlanId, Version, VersionInfo};
use crate::creds::{self, StaticVariables, Variables};
use crate::errors::{ExecError, Result};
use crate::resource::{FetchedArtifact, ResourceFetcher, ResourceInstance, ResourceTypes, Session};
use crate::state::RunState;
use crate::step::{ErrorReporter, Step, StepContext, StepFactory};
use crate::worker::ContainerOwner;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Where a get step's version comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSource {
    /// A literal version.
    Pinned(Version),
    /// The version an upstream put step stored under its plan id.
    FromPut(PlanId),
}

/// Fetches one version of a resource and registers it as an artifact
/// under the step's name.
///
/// A nonzero exit of the resource script is a failed outcome, never an
/// error.
#[derive(Clone)]
pub struct GetStep {
    ctx: StepContext,
    fetcher: Arc<dyn ResourceFetcher>,
    variables: Arc<dyn Variables>,
    resource_type: String,
    source: Value,
    params: Value,
    version: VersionSource,
    tags: Vec<String>,
    resource_types: ResourceTypes,
}

impl GetStep {
    /// Creates a get step for `resource_type`.
    ///
    /// The step's name in `ctx` is the artifact name it registers.
    #[must_use]
    pub fn new(
        ctx: StepContext,
        fetcher: Arc<dyn ResourceFetcher>,
        resource_type: impl Into<String>,
        version: VersionSource,
    ) -> Self {
        Self {
            ctx,
            fetcher,
            variables: Arc::new(StaticVariables::new()),
            resource_type: resource_type.into(),
            source: Value::Object(serde_json::Map::new()),
            params: Value::Object(serde_json::Map::new()),
            version,
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

    /// Sets the (templated) fetch params.
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

impl StepFactory for GetStep {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        let delegate = Arc::clone(self.ctx.delegate());
        Box::new(ErrorReporter::new(
            Box::new(GetAction {
                step: self.clone(),
                state: Arc::clone(state),
                succeeded: None,
            }),
            delegate,
        ))
    }
}

struct GetAction {
    step: GetStep,
    state: Arc<RunState>,
    succeeded: Option<bool>,
}

impl GetAction {
    fn resolve_version(&self) -> Result<Version> {
        match &self.step.version {
            VersionSource::Pinned(version) => Ok(version.clone()),
            VersionSource::FromPut(plan_id) => self
                .state
                .result::<VersionInfo>(plan_id)
                .map(|info| info.version)
                .ok_or_else(|| ExecError::PutVersionMissing {
                    plan_id: plan_id.to_string(),
                }),
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        let ctx = &self.step.ctx;
        let delegate = Arc::clone(ctx.delegate());
        delegate.initializing();

        let source = creds::evaluate(&self.step.source, self.step.variables.as_ref())?;
        let params = creds::evaluate(&self.step.params, self.step.variables.as_ref())?;
        let version = self.resolve_version()?;

        let metadata = ctx.metadata();
        let instance = ResourceInstance::new(
            self.step.resource_type.clone(),
            version,
            source,
            params,
            ContainerOwner::new(metadata.build_id, ctx.plan_id().clone(), metadata.team_id),
        );
        let cache_key = instance.cache_key()?;
        let session = Session {
            tags: self.step.tags.clone(),
            team_id: metadata.team_id,
            env: metadata.env(),
        };

        let fetched = interruptible(
            cancel,
            self.step.fetcher.fetch(
                &session,
                &self.step.resource_types,
                &instance,
                delegate.as_ref(),
                cancel,
            ),
        )
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(ExecError::ResourceScriptFailed { exit_status, stderr }) => {
                warn!(exit_status, stderr = %stderr, "resource script failed");
                delegate.completed(ExitStatus(exit_status), None);
                self.succeeded = Some(false);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let info = VersionInfo::new(fetched.version()).with_metadata(fetched.metadata());
        info!(version = ?info.version, cache_key = %cache_key, "fetched resource");

        self.state
            .artifacts()
            .register_source(ctx.name(), Arc::new(FetchedArtifact::new(cache_key, fetched)));
        self.state.store_result(ctx.plan_id(), info.clone());
        delegate.completed(ExitStatus(0), Some(&info));
        self.succeeded = Some(true);
        Ok(())
    }
}

#[async_trait]
impl Step for GetAction {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let span = self.step.ctx.span().clone();
        self.execute(cancel).instrument(span).await
    }

    fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }
}
