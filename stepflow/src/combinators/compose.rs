//! Sequential composition.

use super::release_all;
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs `first`, then `second`.
///
/// `second` never starts if `first` errors or cancellation has been
/// observed. The outcome is the outcome of `second`.
#[derive(Clone)]
pub struct Compose {
    first: Arc<dyn StepFactory>,
    second: Arc<dyn StepFactory>,
}

impl Compose {
    /// Creates a sequential composition.
    #[must_use]
    pub fn new(first: Arc<dyn StepFactory>, second: Arc<dyn StepFactory>) -> Self {
        Self { first, second }
    }
}

impl StepFactory for Compose {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(ComposeStep {
            state: Arc::clone(state),
            first_factory: Arc::clone(&self.first),
            second_factory: Arc::clone(&self.second),
            first: None,
            second: None,
        })
    }
}

struct ComposeStep {
    state: Arc<RunState>,
    first_factory: Arc<dyn StepFactory>,
    second_factory: Arc<dyn StepFactory>,
    first: Option<Box<dyn Step>>,
    second: Option<Box<dyn Step>>,
}

#[async_trait]
impl Step for ComposeStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let first = self.first.insert(self.first_factory.using(&self.state));
        first.run(cancel).await?;

        if cancel.is_cancelled() {
            debug!("cancelled between sequential steps");
            return Err(ExecError::Interrupted);
        }

        let second = self.second.insert(self.second_factory.using(&self.state));
        second.run(cancel).await
    }

    fn succeeded(&self) -> Option<bool> {
        match (&self.first, &self.second) {
            (_, Some(second)) => second.succeeded(),
            (Some(first), None) => first.succeeded(),
            (None, None) => None,
        }
    }

    async fn release(&mut self) -> Result<()> {
        release_all(self.first.iter_mut().chain(self.second.iter_mut()).collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStepFactory, Journal};
    use pretty_assertions::assert_eq;

    fn state() -> Arc<RunState> {
        Arc::new(RunState::new())
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let journal = Journal::new();
        let a = FakeStepFactory::succeeding().with_journal("a", &journal);
        let b = FakeStepFactory::succeeding().with_journal("b", &journal);

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(journal.entries(), vec!["a.start", "a.end", "b.start", "b.end"]);
        assert_eq!(step.succeeded(), Some(true));
    }

    #[tokio::test]
    async fn test_first_error_skips_second() {
        let a = FakeStepFactory::erroring("nope");
        let b = FakeStepFactory::succeeding();

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        let err = step.run(&CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("nope"));
        assert_eq!(b.using_count(), 0);
        assert_eq!(b.run_count(), 0);
    }

    #[tokio::test]
    async fn test_outcome_delegates_to_second() {
        let a = FakeStepFactory::succeeding();
        let b = FakeStepFactory::failing();

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(false));
    }

    #[tokio::test]
    async fn test_first_failure_still_runs_second() {
        let a = FakeStepFactory::failing();
        let b = FakeStepFactory::succeeding();

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(b.run_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_second() {
        let a = FakeStepFactory::succeeding();
        let b = FakeStepFactory::succeeding();
        let cancel = CancellationToken::new();
        cancel.cancel("abort");

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        let err = step.run(&cancel).await.unwrap_err();

        assert!(err.is_interrupted());
        assert_eq!(a.run_count(), 1);
        assert_eq!(b.run_count(), 0);
    }

    #[tokio::test]
    async fn test_using_is_lazy_and_release_covers_constructed() {
        let a = FakeStepFactory::erroring("boom");
        let b = FakeStepFactory::succeeding();

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        assert_eq!(a.using_count(), 0);

        let _ = step.run(&CancellationToken::new()).await;
        step.release().await.unwrap();

        assert_eq!(a.release_count(), 1);
        assert_eq!(b.release_count(), 0);
    }

    #[tokio::test]
    async fn test_release_errors_are_aggregated() {
        let a = FakeStepFactory::succeeding().with_release_error("release a");
        let b = FakeStepFactory::succeeding().with_release_error("release b");

        let mut step = Compose::new(a.shared(), b.shared()).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        let err = step.release().await.unwrap_err().to_string();

        assert!(err.contains("release a"));
        assert!(err.contains("release b"));
    }
}
