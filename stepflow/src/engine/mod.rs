//! Drives a whole build: bind, run, release, classify.

use crate::cancellation::CancellationToken;
use crate::core::BuildStatus;
use crate::errors::{ExecError, Result};
use crate::observability::build_span;
use crate::plan::{Plan, StepBuilder};
use crate::state::RunState;
use crate::step::{run_once, StepFactory, StepMetadata};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Instrument};

/// How a build ended.
#[derive(Debug)]
pub struct BuildOutcome {
    /// The final status.
    pub status: BuildStatus,
    /// The error that aborted the build, if any.
    pub error: Option<ExecError>,
}

impl BuildOutcome {
    /// Classifies a finished run.
    ///
    /// Interruption means aborted and any other error means errored.
    /// Otherwise a reported failure means failed, and anything else,
    /// including a root step that cannot report, means succeeded.
    #[must_use]
    pub fn classify(res: Result<()>, succeeded: Option<bool>) -> Self {
        let status = match (&res, succeeded) {
            (Err(err), _) if err.is_interrupted() => BuildStatus::Aborted,
            (Err(_), _) => BuildStatus::Errored,
            (Ok(()), Some(false)) => BuildStatus::Failed,
            (Ok(()), _) => BuildStatus::Succeeded,
        };
        Self {
            status,
            error: res.err(),
        }
    }

    /// The message shown as the build's failure reason.
    ///
    /// For an aggregate this is its first member, not the whole list.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.error.as_ref().map(|err| match err {
            ExecError::Aggregate(agg) => agg
                .errors
                .first()
                .map_or_else(|| err.to_string(), ToString::to_string),
            other => other.to_string(),
        })
    }
}

/// Runs `factory` to completion against `state` and classifies the result.
///
/// The root step is released exactly once, whatever happened.
pub async fn run_build(factory: &dyn StepFactory, state: &Arc<RunState>, cancel: &CancellationToken) -> BuildOutcome {
    let started = Instant::now();
    let (res, succeeded) = run_once(factory, state, cancel).await;
    let outcome = BuildOutcome::classify(res, succeeded);

    let elapsed_ms = started.elapsed().as_millis();
    match outcome.failure_reason() {
        Some(reason) => error!(status = %outcome.status, elapsed_ms, reason = %reason, "build finished"),
        None => info!(status = %outcome.status, elapsed_ms, "build finished"),
    }
    outcome
}

/// Compiles `plan` with `builder` and runs it inside a span for `metadata`.
///
/// # Errors
///
/// Only compilation errors are returned here; run errors are part of the
/// outcome.
pub async fn run_plan(
    builder: &StepBuilder,
    plan: &Plan,
    metadata: &StepMetadata,
    state: &Arc<RunState>,
    cancel: &CancellationToken,
) -> Result<BuildOutcome> {
    let span = build_span(metadata);
    let factory = builder
        .clone()
        .with_metadata(metadata.clone())
        .with_span(span.clone())
        .build(plan)?;
    Ok(run_build(factory.as_ref(), state, cancel).instrument(span).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::Ensure;
    use crate::plan::{GetPlan, PlanStep};
    use crate::testing::{FakeResourceFetcher, FakeStepFactory, FakeWorkerClient};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_classifies_outcomes() {
        let state = Arc::new(RunState::new());
        let cancel = CancellationToken::new();

        let ok = run_build(&FakeStepFactory::succeeding(), &state, &cancel).await;
        assert_eq!(ok.status, BuildStatus::Succeeded);
        assert!(ok.error.is_none());

        let failed = run_build(&FakeStepFactory::failing(), &state, &cancel).await;
        assert_eq!(failed.status, BuildStatus::Failed);
        assert!(failed.failure_reason().is_none());

        let errored = run_build(&FakeStepFactory::erroring("disk full"), &state, &cancel).await;
        assert_eq!(errored.status, BuildStatus::Errored);
        assert!(errored.failure_reason().unwrap().contains("disk full"));

        let aborted = run_build(&FakeStepFactory::interrupted(), &state, &cancel).await;
        assert_eq!(aborted.status, BuildStatus::Aborted);
    }

    #[tokio::test]
    async fn test_root_is_released_once() {
        let root = FakeStepFactory::erroring("boom");
        run_build(&root, &Arc::new(RunState::new()), &CancellationToken::new()).await;
        assert_eq!(root.run_count(), 1);
        assert_eq!(root.release_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_reason_is_first_root_cause() {
        let step = FakeStepFactory::erroring("first");
        let hook = FakeStepFactory::erroring("second");
        let ensure = Ensure::new(step.shared(), hook.shared());

        let outcome = run_build(&ensure, &Arc::new(RunState::new()), &CancellationToken::new()).await;

        assert_eq!(outcome.status, BuildStatus::Errored);
        assert!(outcome.error.as_ref().unwrap().to_string().contains("second"));
        assert!(outcome.failure_reason().unwrap().contains("first"));
        assert!(!outcome.failure_reason().unwrap().contains("second"));
    }

    #[tokio::test]
    async fn test_run_plan_compiles_and_runs() {
        let builder = StepBuilder::new(Arc::new(FakeWorkerClient::new()), Arc::new(FakeResourceFetcher::new("x")));
        let plan = Plan::new(
            "1",
            PlanStep::Get(GetPlan {
                name: "repo".to_string(),
                resource_type: "git".to_string(),
                version: Some([("ref".to_string(), "v1".to_string())].into_iter().collect()),
                ..GetPlan::default()
            }),
        );
        let metadata = StepMetadata {
            build_id: 7,
            team_id: 3,
            ..StepMetadata::default()
        };
        let state = Arc::new(RunState::new());

        let outcome = run_plan(&builder, &plan, &metadata, &state, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, BuildStatus::Succeeded);
        assert!(state.artifacts().source_for("repo").is_some());
    }

    #[tokio::test]
    async fn test_run_plan_rejects_invalid_plans() {
        let builder = StepBuilder::new(Arc::new(FakeWorkerClient::new()), Arc::new(FakeResourceFetcher::new("x")));
        let plan = Plan::new("1", PlanStep::Retry(Vec::new()));

        let res = run_plan(
            &builder,
            &plan,
            &StepMetadata::default(),
            &Arc::new(RunState::new()),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(res, Err(ExecError::InvalidPlan { .. })));
    }
}
