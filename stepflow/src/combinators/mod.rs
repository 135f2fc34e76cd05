//! Control-flow combinators: the scheduler proper.
//!
//! Each combinator is a stateless [`StepFactory`](crate::step::StepFactory)
//! producing one live step per `using` call. Every step a combinator
//! constructs is released exactly once when the combinator itself is
//! released, and release errors are aggregated rather than masking each
//! other.

mod aggregate;
mod compose;
mod hooked_compose;
mod hooks;
mod identity;
mod retry;
mod timeout;
mod try_step;

pub use aggregate::Aggregate;
pub use compose::Compose;
pub use hooked_compose::HookedCompose;
pub use hooks::{Ensure, OnAbort, OnFailure, OnSuccess};
pub use identity::Identity;
pub use retry::Retry;
pub use timeout::Timeout;
pub use try_step::Try;

use crate::errors::{ExecError, Result};
use crate::step::Step;

/// Releases every step in `steps`, aggregating the errors.
pub(crate) async fn release_all(steps: Vec<&mut Box<dyn Step>>) -> Result<()> {
    let mut errors = Vec::new();
    for step in steps {
        if let Err(err) = step.release().await {
            errors.push(err);
        }
    }
    match ExecError::aggregate(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// ANDs two outcomes, treating "cannot report" as neutral.
pub(crate) fn and_outcomes(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a && b),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}
