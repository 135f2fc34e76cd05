//! Conditional and unconditional hooks.
//!
//! This module provides:
//! - OnSuccess and OnFailure, keyed off the outcome of a step that ran to
//!   completion without error
//! - OnAbort, keyed off the interrupted error specifically
//! - Ensure, which always runs its hook and never drops either error
//!
//! Abort and ensure hooks run under a fresh token so that cleanup still
//! happens after the build has been cancelled.

use super::{and_outcomes, release_all};
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Success,
    Failure,
    Abort,
    Always,
}

impl Trigger {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "on_success",
            Self::Failure => "on_failure",
            Self::Abort => "on_abort",
            Self::Always => "ensure",
        }
    }
}

#[derive(Clone)]
struct Hooked {
    trigger: Trigger,
    step: Arc<dyn StepFactory>,
    hook: Arc<dyn StepFactory>,
}

impl Hooked {
    fn bind(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(HookedStep {
            trigger: self.trigger,
            state: Arc::clone(state),
            hook_factory: Arc::clone(&self.hook),
            step: self.step.using(state),
            hook: None,
        })
    }
}

macro_rules! hook_factory {
    ($(#[$doc:meta])* $name:ident, $trigger:expr) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name(Hooked);

        impl $name {
            /// Attaches `hook` to `step`.
            #[must_use]
            pub fn new(step: Arc<dyn StepFactory>, hook: Arc<dyn StepFactory>) -> Self {
                Self(Hooked {
                    trigger: $trigger,
                    step,
                    hook,
                })
            }
        }

        impl StepFactory for $name {
            fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
                self.0.bind(state)
            }
        }
    };
}

hook_factory!(
    /// Runs the hook only if the step completed without error and succeeded.
    ///
    /// The outcome is the AND of the step and the hook.
    OnSuccess,
    Trigger::Success
);

hook_factory!(
    /// Runs the hook only if the step completed without error and failed.
    ///
    /// The outcome is the step's own.
    OnFailure,
    Trigger::Failure
);

hook_factory!(
    /// Runs the hook only if the step was interrupted.
    ///
    /// The interrupted error is still returned afterwards.
    OnAbort,
    Trigger::Abort
);

hook_factory!(
    /// Always runs the hook after the step.
    ///
    /// Errors from both are aggregated and the outcome is the AND of both.
    Ensure,
    Trigger::Always
);

struct HookedStep {
    trigger: Trigger,
    state: Arc<RunState>,
    hook_factory: Arc<dyn StepFactory>,
    step: Box<dyn Step>,
    hook: Option<Box<dyn Step>>,
}

impl HookedStep {
    async fn run_hook(&mut self, cancel: &CancellationToken) -> Result<()> {
        debug!(hook = self.trigger.as_str(), "running hook");
        let hook = self.hook.insert(self.hook_factory.using(&self.state));
        hook.run(cancel).await
    }
}

#[async_trait]
impl Step for HookedStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let res = self.step.run(cancel).await;
        let outcome = self.step.succeeded();

        match self.trigger {
            Trigger::Success | Trigger::Failure => {
                res?;
                let wanted = self.trigger == Trigger::Success;
                if outcome == Some(wanted) {
                    self.run_hook(cancel).await?;
                }
                Ok(())
            }
            Trigger::Abort => match res {
                Err(err) if err.is_interrupted() => {
                    let hooked = self.run_hook(&CancellationToken::new()).await;
                    ExecError::join(Err(err), [hooked])
                }
                other => other,
            },
            Trigger::Always => {
                let hooked = self.run_hook(&CancellationToken::new()).await;
                ExecError::join(res, [hooked])
            }
        }
    }

    fn succeeded(&self) -> Option<bool> {
        let step = self.step.succeeded();
        match (self.trigger, &self.hook) {
            (Trigger::Success | Trigger::Always, Some(hook)) => and_outcomes(step, hook.succeeded()),
            _ => step,
        }
    }

    async fn release(&mut self) -> Result<()> {
        release_all(std::iter::once(&mut self.step).chain(self.hook.iter_mut()).collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStepFactory, Journal};
    use std::time::Duration;

    fn state() -> Arc<RunState> {
        Arc::new(RunState::new())
    }

    async fn run(factory: &dyn StepFactory, cancel: &CancellationToken) -> (Result<()>, Option<bool>) {
        let mut step = factory.using(&state());
        let res = step.run(cancel).await;
        (res, step.succeeded())
    }

    #[tokio::test]
    async fn test_on_success_runs_hook_after_step() {
        let journal = Journal::new();
        let step = FakeStepFactory::succeeding().with_journal("step", &journal);
        let hook = FakeStepFactory::failing().with_journal("hook", &journal);

        let (res, outcome) = run(&OnSuccess::new(step.shared(), hook.shared()), &CancellationToken::new()).await;

        assert!(res.is_ok());
        assert_eq!(journal.entries(), vec!["step.start", "step.end", "hook.start", "hook.end"]);
        assert_eq!(outcome, Some(false));
    }

    #[tokio::test]
    async fn test_on_success_skips_hook_on_failure_or_error() {
        let hook = FakeStepFactory::succeeding();

        let failing = FakeStepFactory::failing();
        let (res, outcome) = run(&OnSuccess::new(failing.shared(), hook.shared()), &CancellationToken::new()).await;
        assert!(res.is_ok());
        assert_eq!(outcome, Some(false));

        let erroring = FakeStepFactory::erroring("bad");
        let (res, _) = run(&OnSuccess::new(erroring.shared(), hook.shared()), &CancellationToken::new()).await;
        assert!(res.is_err());

        assert_eq!(hook.run_count(), 0);
    }

    #[tokio::test]
    async fn test_on_failure_skips_hook_on_success() {
        let step = FakeStepFactory::succeeding();
        let hook = FakeStepFactory::succeeding();

        let (res, outcome) = run(&OnFailure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;

        assert!(res.is_ok());
        assert_eq!(outcome, Some(true));
        assert_eq!(hook.run_count(), 0);
    }

    #[tokio::test]
    async fn test_on_failure_runs_hook_and_keeps_step_outcome() {
        let step = FakeStepFactory::failing();
        let hook = FakeStepFactory::succeeding();

        let (res, outcome) = run(&OnFailure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;

        assert!(res.is_ok());
        assert_eq!(outcome, Some(false));
        assert_eq!(hook.run_count(), 1);
    }

    #[tokio::test]
    async fn test_on_failure_hook_error_propagates() {
        let step = FakeStepFactory::failing();
        let hook = FakeStepFactory::erroring("notify failed");

        let (res, _) = run(&OnFailure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;
        assert!(res.unwrap_err().to_string().contains("notify failed"));
    }

    #[tokio::test]
    async fn test_on_abort_only_on_interruption() {
        let hook = FakeStepFactory::succeeding();

        let erroring = FakeStepFactory::erroring("plain failure");
        let (res, _) = run(&OnAbort::new(erroring.shared(), hook.shared()), &CancellationToken::new()).await;
        assert!(!res.unwrap_err().is_interrupted());
        assert_eq!(hook.run_count(), 0);

        let interrupted = FakeStepFactory::interrupted();
        let (res, _) = run(&OnAbort::new(interrupted.shared(), hook.shared()), &CancellationToken::new()).await;
        assert!(res.unwrap_err().is_interrupted());
        assert_eq!(hook.run_count(), 1);
    }

    #[tokio::test]
    async fn test_on_abort_hook_runs_after_cancellation() {
        let step = FakeStepFactory::blocking();
        let hook = FakeStepFactory::sleeping(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel("abort");
        });

        let (res, _) = run(&OnAbort::new(step.shared(), hook.shared()), &cancel).await;

        assert!(res.unwrap_err().is_interrupted());
        assert_eq!(hook.run_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_aggregates_both_errors() {
        let step = FakeStepFactory::erroring("E1");
        let hook = FakeStepFactory::erroring("E2");

        let (res, _) = run(&Ensure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;

        let text = res.unwrap_err().to_string();
        assert!(text.contains("E1"));
        assert!(text.contains("E2"));
    }

    #[tokio::test]
    async fn test_ensure_runs_even_when_cancelled() {
        let step = FakeStepFactory::interrupted();
        let hook = FakeStepFactory::succeeding();
        let cancel = CancellationToken::new();
        cancel.cancel("abort");

        let (res, _) = run(&Ensure::new(step.shared(), hook.shared()), &cancel).await;

        assert!(res.unwrap_err().is_interrupted());
        assert_eq!(hook.run_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_outcome_ands_step_and_hook() {
        let step = FakeStepFactory::succeeding();
        let hook = FakeStepFactory::failing();
        let (_, outcome) = run(&Ensure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;
        assert_eq!(outcome, Some(false));

        let step = FakeStepFactory::succeeding();
        let hook = FakeStepFactory::silent();
        let (_, outcome) = run(&Ensure::new(step.shared(), hook.shared()), &CancellationToken::new()).await;
        assert_eq!(outcome, Some(true));
    }

    #[tokio::test]
    async fn test_release_covers_step_and_hook() {
        let step = FakeStepFactory::succeeding().with_release_error("step leak");
        let hook = FakeStepFactory::succeeding().with_release_error("hook leak");

        let mut live = Ensure::new(step.shared(), hook.shared()).using(&state());
        live.run(&CancellationToken::new()).await.unwrap();
        let text = live.release().await.unwrap_err().to_string();

        assert!(text.contains("step leak"));
        assert!(text.contains("hook leak"));
    }

    #[tokio::test]
    async fn test_hook_not_built_when_not_run() {
        let step = FakeStepFactory::succeeding();
        let hook = FakeStepFactory::succeeding();

        let mut live = OnFailure::new(step.shared(), hook.shared()).using(&state());
        live.run(&CancellationToken::new()).await.unwrap();
        live.release().await.unwrap();

        assert_eq!(step.release_count(), 1);
        assert_eq!(hook.using_count(), 0);
    }
}
