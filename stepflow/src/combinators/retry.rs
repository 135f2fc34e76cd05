//! Sequential retry over a list of attempts.

use super::release_all;
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Tries each attempt in order until one succeeds.
///
/// An attempt succeeds when its run returns no error and it reports
/// `Some(true)`. An interrupted error stops retrying straight away. When
/// every attempt is used up, the last attempt's error and outcome stand.
#[derive(Clone)]
pub struct Retry {
    attempts: Vec<Arc<dyn StepFactory>>,
}

impl Retry {
    /// Creates a retry over `attempts`.
    #[must_use]
    pub fn new(attempts: Vec<Arc<dyn StepFactory>>) -> Self {
        Self { attempts }
    }

    /// The number of configured attempts.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.len()
    }
}

impl StepFactory for Retry {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(RetryStep {
            state: Arc::clone(state),
            attempts: self.attempts.clone(),
            tried: Vec::new(),
        })
    }
}

struct RetryStep {
    state: Arc<RunState>,
    attempts: Vec<Arc<dyn StepFactory>>,
    tried: Vec<Box<dyn Step>>,
}

#[async_trait]
impl Step for RetryStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let total = self.attempts.len();
        let mut last = Ok(());

        for (index, factory) in self.attempts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ExecError::Interrupted);
            }

            let attempt = index + 1;
            debug!(attempt, total, "starting attempt");

            self.tried.push(factory.using(&self.state));
            let Some(step) = self.tried.last_mut() else {
                break;
            };

            let res = step.run(cancel).await;
            let interrupted = res.as_ref().is_err_and(ExecError::is_interrupted);
            if interrupted || (res.is_ok() && step.succeeded() == Some(true)) {
                return res;
            }

            match &res {
                Err(err) => info!(attempt, total, error = %err, "attempt errored"),
                Ok(()) => info!(attempt, total, "attempt failed"),
            }
            last = res;
        }

        last
    }

    fn succeeded(&self) -> Option<bool> {
        self.tried.last().and_then(|step| step.succeeded())
    }

    async fn release(&mut self) -> Result<()> {
        release_all(self.tried.iter_mut().collect()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStepFactory;

    fn state() -> Arc<RunState> {
        Arc::new(RunState::new())
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let first = FakeStepFactory::failing();
        let second = FakeStepFactory::failing();
        let third = FakeStepFactory::succeeding();

        let retry = Retry::new(vec![first.shared(), second.shared(), third.shared()]);
        let mut step = retry.using(&state());
        step.run(&CancellationToken::new()).await.unwrap();

        let runs = first.run_count() + second.run_count() + third.run_count();
        assert_eq!(runs, 3);
        assert_eq!(step.succeeded(), Some(true));
    }

    #[tokio::test]
    async fn test_later_attempts_skipped_after_success() {
        let first = FakeStepFactory::succeeding();
        let second = FakeStepFactory::succeeding();

        let mut step = Retry::new(vec![first.shared(), second.shared()]).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(first.run_count(), 1);
        assert_eq!(second.using_count(), 0);
    }

    #[tokio::test]
    async fn test_interruption_is_not_retried() {
        let first = FakeStepFactory::failing();
        let second = FakeStepFactory::interrupted();
        let third = FakeStepFactory::succeeding();

        let retry = Retry::new(vec![first.shared(), second.shared(), third.shared()]);
        let mut step = retry.using(&state());
        let err = step.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, ExecError::Interrupted));
        assert_eq!(first.run_count() + second.run_count(), 2);
        assert_eq!(third.run_count(), 0);
    }

    #[tokio::test]
    async fn test_errors_advance_and_last_one_stands() {
        let first = FakeStepFactory::erroring("first broke");
        let second = FakeStepFactory::erroring("second broke");

        let mut step = Retry::new(vec![first.shared(), second.shared()]).using(&state());
        let err = step.run(&CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("second broke"));
        assert_eq!(first.run_count(), 1);
        assert_eq!(second.run_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_reports_last_outcome() {
        let first = FakeStepFactory::erroring("flaky");
        let second = FakeStepFactory::failing();

        let mut step = Retry::new(vec![first.shared(), second.shared()]).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(false));
    }

    #[tokio::test]
    async fn test_every_attempt_is_released() {
        let first = FakeStepFactory::failing();
        let second = FakeStepFactory::failing();

        let mut step = Retry::new(vec![first.shared(), second.shared()]).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        step.release().await.unwrap();

        assert_eq!(first.release_count(), 1);
        assert_eq!(second.release_count(), 1);
    }

    #[tokio::test]
    async fn test_no_attempt_after_cancellation() {
        let only = FakeStepFactory::succeeding();
        let cancel = CancellationToken::new();
        cancel.cancel("abort");

        let mut step = Retry::new(vec![only.shared()]).using(&state());
        assert!(step.run(&cancel).await.unwrap_err().is_interrupted());
        assert_eq!(only.using_count(), 0);
    }
}
