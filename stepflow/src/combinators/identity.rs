//! The neutral step.

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;

/// A step that does nothing and reports no outcome.
///
/// Used as the default for hooks a plan leaves empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Identity {
    /// Creates the neutral step factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// The neutral step factory, ready for use in a plan.
    #[must_use]
    pub fn shared() -> Arc<dyn StepFactory> {
        Arc::new(Self)
    }
}

impl StepFactory for Identity {
    fn using(&self, _state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(Self)
    }
}

#[async_trait]
impl Step for Identity {
    async fn run(&mut self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn succeeded(&self) -> Option<bool> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::run_once;

    #[tokio::test]
    async fn test_identity_is_neutral() {
        let state = Arc::new(RunState::new());
        let (res, outcome) = run_once(&Identity, &state, &CancellationToken::new()).await;
        assert!(res.is_ok());
        assert_eq!(outcome, None);
        assert!(state.artifacts().is_empty());
    }
}
