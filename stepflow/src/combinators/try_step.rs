//! Failure-absorbing wrapper.

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Absorbs every outcome of a step except interruption.
///
/// Errors and failures are swallowed and the wrapper always reports success.
#[derive(Clone)]
pub struct Try {
    step: Arc<dyn StepFactory>,
}

impl Try {
    /// Wraps `step`.
    #[must_use]
    pub fn new(step: Arc<dyn StepFactory>) -> Self {
        Self { step }
    }
}

impl StepFactory for Try {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(TryStep {
            step: self.step.using(state),
        })
    }
}

struct TryStep {
    step: Box<dyn Step>,
}

#[async_trait]
impl Step for TryStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.step.run(cancel).await {
            Err(err) if err.is_interrupted() => Err(err),
            Err(err) => {
                debug!(error = %err, "ignoring error from tried step");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn succeeded(&self) -> Option<bool> {
        Some(true)
    }

    async fn release(&mut self) -> Result<()> {
        self.step.release().await
    }
}
