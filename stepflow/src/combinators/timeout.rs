//! Deadline-bounded steps.

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Races a step against a deadline.
///
/// When the deadline passes first the step is cancelled through its own
/// scoped token and the timeout surfaces as `Some(false)` with no error.
/// Cancellation from outside still propagates as an interrupted error.
#[derive(Clone)]
pub struct Timeout {
    step: Arc<dyn StepFactory>,
    duration: Duration,
}

impl Timeout {
    /// Bounds `step` by `duration`.
    #[must_use]
    pub fn new(step: Arc<dyn StepFactory>, duration: Duration) -> Self {
        Self { step, duration }
    }

    /// The configured deadline.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }
}

impl StepFactory for Timeout {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(TimeoutStep {
            step: self.step.using(state),
            duration: self.duration,
            timed_out: false,
        })
    }
}

struct TimeoutStep {
    step: Box<dyn Step>,
    duration: Duration,
    timed_out: bool,
}

#[async_trait]
impl Step for TimeoutStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let scoped = cancel.child_token();
        let mut run = self.step.run(&scoped);

        let res = tokio::select! {
            res = &mut run => return res,
            () = tokio::time::sleep(self.duration) => {
                scoped.cancel("timeout exceeded");
                run.await
            }
        };

        if cancel.is_cancelled() {
            return res;
        }

        match res {
            Err(err) if err.is_interrupted() => {
                info!(timeout_ms = self.duration.as_millis(), "step timed out");
                self.timed_out = true;
                Ok(())
            }
            other => other,
        }
    }

    fn succeeded(&self) -> Option<bool> {
        if self.timed_out {
            return Some(false);
        }
        self.step.succeeded()
    }

    async fn release(&mut self) -> Result<()> {
        self.step.release().await
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
    async fn test_deadline_reports_failure_without_error() {
        let inner = FakeStepFactory::blocking();
        let mut step = Timeout::new(inner.shared(), Duration::from_millis(20)).using(&state());

        step.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(step.succeeded(), Some(false));
        assert_eq!(inner.run_count(), 1);
    }

    #[tokio::test]
    async fn test_transparent_before_deadline() {
        let passing = FakeStepFactory::succeeding();
        let mut step = Timeout::new(passing.shared(), Duration::from_secs(5)).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(true));

        let failing = FakeStepFactory::failing();
        let mut step = Timeout::new(failing.shared(), Duration::from_secs(5)).using(&state());
        step.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(step.succeeded(), Some(false));

        let erroring = FakeStepFactory::erroring("broken");
        let mut step = Timeout::new(erroring.shared(), Duration::from_secs(5)).using(&state());
        let err = step.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_outside_cancellation_is_an_error() {
        let inner = FakeStepFactory::blocking();
        let mut step = Timeout::new(inner.shared(), Duration::from_secs(30)).using(&state());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel("abort");
        });

        let err = step.run(&cancel).await.unwrap_err();
        assert!(err.is_interrupted());
    }

    #[tokio::test]
    async fn test_deadline_does_not_cancel_parent() {
        let inner = FakeStepFactory::blocking();
        let cancel = CancellationToken::new();
        let mut step = Timeout::new(inner.shared(), Duration::from_millis(10)).using(&state());

        step.run(&cancel).await.unwrap();
        assert!(!cancel.is_cancelled());
    }
}
