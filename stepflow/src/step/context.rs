//! The explicit context every primitive step is constructed with.

use crate::core::PlanId;
use crate::events::{BuildStepDelegate, NoOpDelegate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Span;

/// Build-level metadata exposed to step processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Build id.
    pub build_id: i64,
    /// Build name, e.g. `"42"`.
    #[serde(default)]
    pub build_name: String,
    /// Owning team id.
    pub team_id: i64,
    /// Owning team name.
    #[serde(default)]
    pub team_name: String,
    /// Pipeline name, empty for one-off builds.
    #[serde(default)]
    pub pipeline_name: String,
    /// Job name, empty for one-off builds.
    #[serde(default)]
    pub job_name: String,
    /// Public URL of the orchestrator.
    #[serde(default)]
    pub external_url: String,
}

impl StepMetadata {
    /// Renders the metadata as `KEY=VALUE` environment entries.
    ///
    /// Empty fields are left out.
    #[must_use]
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![format!("BUILD_ID={}", self.build_id)];

        let fields = [
            ("BUILD_NAME", &self.build_name),
            ("BUILD_TEAM_NAME", &self.team_name),
            ("BUILD_PIPELINE_NAME", &self.pipeline_name),
            ("BUILD_JOB_NAME", &self.job_name),
            ("ATC_EXTERNAL_URL", &self.external_url),
        ];
        for (key, value) in fields {
            if !value.is_empty() {
                env.push(format!("{key}={value}"));
            }
        }
        env
    }
}

/// Logger, delegate and identity for one primitive step.
///
/// Handed to the step at construction; nothing is looked up globally.
#[derive(Clone)]
pub struct StepContext {
    plan_id: PlanId,
    name: String,
    span: Span,
    delegate: Arc<dyn BuildStepDelegate>,
    metadata: StepMetadata,
}

impl StepContext {
    /// Creates a context for the step `name` executing `plan_id`.
    #[must_use]
    pub fn new(plan_id: PlanId, name: impl Into<String>) -> Self {
        let name = name.into();
        let span = tracing::info_span!("step", plan_id = %plan_id, step = %name);
        Self {
            plan_id,
            name,
            span,
            delegate: Arc::new(NoOpDelegate),
            metadata: StepMetadata::default(),
        }
    }

    /// Sets the delegate.
    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn BuildStepDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    /// Sets the build metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: StepMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parents the step's span under `parent`.
    #[must_use]
    pub fn with_parent_span(mut self, parent: &Span) -> Self {
        self.span = tracing::info_span!(parent: parent, "step", plan_id = %self.plan_id, step = %self.name);
        self
    }

    /// The plan id.
    #[must_use]
    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    /// The step's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The step's span.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The delegate.
    #[must_use]
    pub fn delegate(&self) -> &Arc<dyn BuildStepDelegate> {
        &self.delegate
    }

    /// The build metadata.
    #[must_use]
    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("plan_id", &self.plan_id)
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_env_skips_empty() {
        let metadata = StepMetadata {
            build_id: 7,
            build_name: "3".to_string(),
            team_name: "main".to_string(),
            ..StepMetadata::default()
        };
        assert_eq!(
            metadata.env(),
            vec!["BUILD_ID=7", "BUILD_NAME=3", "BUILD_TEAM_NAME=main"]
        );
    }

    #[test]
    fn test_context_accessors() {
        let ctx = StepContext::new(PlanId::new("p1"), "unit-tests");
        assert_eq!(ctx.plan_id().as_str(), "p1");
        assert_eq!(ctx.name(), "unit-tests");
        assert_eq!(ctx.metadata().build_id, 0);
    }
}
