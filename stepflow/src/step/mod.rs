//! The Step protocol.
//!
//! A [`StepFactory`] is a compiled, reusable plan node. Binding it to a
//! build's [`RunState`] with [`StepFactory::using`] yields a fresh [`Step`]:
//! one live execution that is run once and released once.

mod context;
mod reporters;

pub use context::{StepContext, StepMetadata};
pub use reporters::{ErrorReporter, SuccessReporter};

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::state::RunState;
use async_trait::async_trait;
use std::sync::Arc;

/// One live execution of a plan node.
///
/// `succeeded` is meaningful only after `run` has returned. `release` is
/// called exactly once by whoever constructed the step, whether or not `run`
/// was ever called or completed.
#[async_trait]
pub trait Step: Send {
    /// Runs the step until it completes or `cancel` fires.
    ///
    /// Once cancellation is observed the step returns promptly with
    /// [`ExecError::Interrupted`](crate::errors::ExecError::Interrupted).
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Whether the step's action succeeded.
    ///
    /// `None` means the step cannot report an outcome (it never ran, it
    /// errored, or it is a no-op).
    fn succeeded(&self) -> Option<bool>;

    /// Releases whatever the step holds on to.
    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A reusable plan node that produces steps.
///
/// `using` must be cheap and free of side effects: it is called once per
/// execution attempt.
pub trait StepFactory: Send + Sync {
    /// Binds the node to `state`, producing a fresh step.
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step>;
}

impl<F> StepFactory for F
where
    F: Fn(&Arc<RunState>) -> Box<dyn Step> + Send + Sync,
{
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        self(state)
    }
}

/// Binds, runs and releases `factory` against `state`.
///
/// Returns the run error (joined with any release error) and the step's
/// reported outcome.
pub async fn run_once(
    factory: &dyn StepFactory,
    state: &Arc<RunState>,
    cancel: &CancellationToken,
) -> (Result<()>, Option<bool>) {
    let mut step = factory.using(state);
    let res = step.run(cancel).await;
    let succeeded = step.succeeded();
    let released = step.release().await;
    (crate::errors::ExecError::join(res, [released]), succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStep, FakeStepFactory};

    #[tokio::test]
    async fn test_closure_is_a_factory() {
        let factory = |_: &Arc<RunState>| -> Box<dyn Step> { Box::new(FakeStep::succeeding()) };
        let state = Arc::new(RunState::new());
        let (res, succeeded) = run_once(&factory, &state, &CancellationToken::new()).await;
        assert!(res.is_ok());
        assert_eq!(succeeded, Some(true));
    }

    #[tokio::test]
    async fn test_run_once_releases() {
        let factory = FakeStepFactory::succeeding();
        let state = Arc::new(RunState::new());
        let (res, _) = run_once(&factory, &state, &CancellationToken::new()).await;
        assert!(res.is_ok());
        assert_eq!(factory.using_count(), 1);
        assert_eq!(factory.run_count(), 1);
        assert_eq!(factory.release_count(), 1);
    }
}
