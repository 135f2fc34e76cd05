//! Steps that report on the steps they wrap.

use super::{Step, StepFactory};
use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::events::BuildStepDelegate;
use crate::state::RunState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Reports a wrapped step's infrastructure errors to its delegate.
///
/// Interruptions are not failures and are passed through unreported.
pub struct ErrorReporter {
    step: Box<dyn Step>,
    delegate: Arc<dyn BuildStepDelegate>,
}

impl ErrorReporter {
    /// Wraps `step`, reporting to `delegate`.
    #[must_use]
    pub fn new(step: Box<dyn Step>, delegate: Arc<dyn BuildStepDelegate>) -> Self {
        Self { step, delegate }
    }
}

#[async_trait]
impl Step for ErrorReporter {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let res = self.step.run(cancel).await;
        if let Err(err) = &res {
            if !err.is_interrupted() {
                self.delegate.failed(err);
            }
        }
        res
    }

    fn succeeded(&self) -> Option<bool> {
        self.step.succeeded()
    }

    async fn release(&mut self) -> Result<()> {
        self.step.release().await
    }
}

/// Tracks whether every subject step of a build succeeded.
///
/// A reporter with no subjects, or whose subjects all succeeded or could not
/// report, is successful.
#[derive(Debug, Clone)]
pub struct SuccessReporter {
    successful: Arc<Mutex<bool>>,
}

impl Default for SuccessReporter {
    fn default() -> Self {
        Self {
            successful: Arc::new(Mutex::new(true)),
        }
    }
}

impl SuccessReporter {
    /// Creates a reporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps `factory` so that its steps report to this tracker.
    #[must_use]
    pub fn subject(&self, factory: Arc<dyn StepFactory>) -> Arc<dyn StepFactory> {
        Arc::new(SubjectFactory {
            reporter: self.clone(),
            factory,
        })
    }

    /// Whether no subject step has reported failure.
    #[must_use]
    pub fn successful(&self) -> bool {
        *self.successful.lock()
    }

    fn fail(&self) {
        *self.successful.lock() = false;
    }
}

struct SubjectFactory {
    reporter: SuccessReporter,
    factory: Arc<dyn StepFactory>,
}

impl StepFactory for SubjectFactory {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(SubjectStep {
            reporter: self.reporter.clone(),
            step: self.factory.using(state),
        })
    }
}

struct SubjectStep {
    reporter: SuccessReporter,
    step: Box<dyn Step>,
}

#[async_trait]
impl Step for SubjectStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let res = self.step.run(cancel).await;
        if self.step.succeeded() == Some(false) {
            warn!("subject step reported failure");
            self.reporter.fail();
        }
        res
    }

    fn succeeded(&self) -> Option<bool> {
        self.step.succeeded()
    }

    async fn release(&mut self) -> Result<()> {
        self.step.release().await
    }
}
