//! Parallel groups.

use super::release_all;
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

/// Runs every branch concurrently and waits for all of them.
///
/// A failing branch does not stop its siblings. Cancellation reaches every
/// branch still running. The error is the aggregate of every branch error;
/// the outcome is the AND over branches that can report one, and false if
/// none can.
#[derive(Clone, Default)]
pub struct Aggregate {
    branches: Vec<(String, Arc<dyn StepFactory>)>,
}

impl Aggregate {
    /// Creates an empty parallel group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named branch.
    #[must_use]
    pub fn with_branch(mut self, name: impl Into<String>, factory: Arc<dyn StepFactory>) -> Self {
        self.branches.push((name.into(), factory));
        self
    }

    /// The number of branches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Returns true if the group has no branches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

impl FromIterator<(String, Arc<dyn StepFactory>)> for Aggregate {
    fn from_iter<T: IntoIterator<Item = (String, Arc<dyn StepFactory>)>>(iter: T) -> Self {
        Self {
            branches: iter.into_iter().collect(),
        }
    }
}

impl StepFactory for Aggregate {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(AggregateStep {
            state: Arc::clone(state),
            branches: self.branches.clone(),
            steps: Vec::new(),
        })
    }
}

struct AggregateStep {
    state: Arc<RunState>,
    branches: Vec<(String, Arc<dyn StepFactory>)>,
    steps: Vec<Box<dyn Step>>,
}

#[async_trait]
impl Step for AggregateStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut handles = Vec::with_capacity(self.branches.len());
        for (name, factory) in &self.branches {
            let mut step = factory.using(&self.state);
            let token = cancel.clone();
            let handle = tokio::spawn(
                async move {
                    let res = match AssertUnwindSafe(step.run(&token)).catch_unwind().await {
                        Ok(res) => res,
                        Err(_) => Err(ExecError::internal("branch panicked")),
                    };
                    (step, res)
                }
                .in_current_span(),
            );
            handles.push((name.clone(), handle));
        }
        debug!(branches = handles.len(), "started parallel branches");

        let mut errors = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok((step, res)) => {
                    self.steps.push(step);
                    if let Err(err) = res {
                        debug!(branch = %name, error = %err, "branch errored");
                        errors.push(err);
                    }
                }
                Err(join_err) => {
                    warn!(branch = %name, error = %join_err, "branch task failed");
                    errors.push(ExecError::internal(format!(
                        "branch '{name}' did not complete: {join_err}"
                    )));
                }
            }
        }

        match ExecError::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn succeeded(&self) -> Option<bool> {
        let outcomes: Vec<bool> = self.steps.iter().filter_map(|s| s.succeeded()).collect();
        if outcomes.is_empty() {
            return Some(false);
        }
        Some(outcomes.into_iter().all(|ok| ok))
    }

    async fn release(&mut self) -> Result<()> {
        release_all(self.steps.iter_mut().collect()).await
    }
}
