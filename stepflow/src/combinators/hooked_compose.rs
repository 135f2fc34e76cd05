//! A step with its hooks and its continuation.

use super::release_all;
use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs a step, then its hooks, then the next step.
///
/// After the step completes exactly one of `on_success` and `on_failure`
/// runs, concurrently with `ensure`. `next` starts only once both are done,
/// and only if the step succeeded and every hook that ran reported success.
/// A hook that cannot report blocks `next`. Every error encountered along
/// the way is aggregated.
///
/// If the step itself errors only `ensure` runs. `ensure` always runs under
/// a fresh token so cleanup is not suppressed by cancellation.
#[derive(Clone)]
pub struct HookedCompose {
    step: Arc<dyn StepFactory>,
    next: Arc<dyn StepFactory>,
    on_failure: Option<Arc<dyn StepFactory>>,
    on_success: Option<Arc<dyn StepFactory>>,
    ensure: Option<Arc<dyn StepFactory>>,
}

impl HookedCompose {
    /// Composes `step` with `next`. Hooks left unset are skipped.
    #[must_use]
    pub fn new(step: Arc<dyn StepFactory>, next: Arc<dyn StepFactory>) -> Self {
        Self {
            step,
            next,
            on_failure: None,
            on_success: None,
            ensure: None,
        }
    }

    /// Sets the hook run when the step fails.
    #[must_use]
    pub fn with_on_failure(mut self, hook: Arc<dyn StepFactory>) -> Self {
        self.on_failure = Some(hook);
        self
    }

    /// Sets the hook run when the step succeeds.
    #[must_use]
    pub fn with_on_success(mut self, hook: Arc<dyn StepFactory>) -> Self {
        self.on_success = Some(hook);
        self
    }

    /// Sets the hook that always runs.
    #[must_use]
    pub fn with_ensure(mut self, hook: Arc<dyn StepFactory>) -> Self {
        self.ensure = Some(hook);
        self
    }
}

impl StepFactory for HookedCompose {
    fn using(&self, state: &Arc<RunState>) -> Box<dyn Step> {
        Box::new(HookedComposeStep {
            state: Arc::clone(state),
            plan: self.clone(),
            step: None,
            hook: None,
            ensure: None,
            next: None,
        })
    }
}

struct HookedComposeStep {
    state: Arc<RunState>,
    plan: HookedCompose,
    step: Option<Box<dyn Step>>,
    hook: Option<Box<dyn Step>>,
    ensure: Option<Box<dyn Step>>,
    next: Option<Box<dyn Step>>,
}

/// Runs `hook` if one was built. An absent hook passes.
async fn run_hook(hook: Option<&mut Box<dyn Step>>, cancel: &CancellationToken) -> Result<bool> {
    match hook {
        Some(hook) => {
            hook.run(cancel).await?;
            Ok(hook.succeeded() == Some(true))
        }
        None => Ok(true),
    }
}

#[async_trait]
impl Step for HookedComposeStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let step = self.step.insert(self.plan.step.using(&self.state));
        let res = step.run(cancel).await;
        let outcome = step.succeeded();

        let detached = CancellationToken::new();
        if let Some(factory) = &self.plan.ensure {
            self.ensure = Some(factory.using(&self.state));
        }

        if let Err(err) = res {
            debug!(error = %err, "step errored, running ensure only");
            let ensured = run_hook(self.ensure.as_mut(), &detached).await.map(drop);
            return ExecError::join(Err(err), [ensured]);
        }

        let hook_factory = if outcome == Some(true) {
            &self.plan.on_success
        } else {
            &self.plan.on_failure
        };
        if let Some(factory) = hook_factory {
            self.hook = Some(factory.using(&self.state));
        }

        let (hooked, ensured) = futures::join!(
            run_hook(self.hook.as_mut(), cancel),
            run_hook(self.ensure.as_mut(), &detached),
        );
        let hook_ok = matches!(hooked, Ok(true));
        let ensure_ok = matches!(ensured, Ok(true));
        ExecError::join(hooked.map(drop), [ensured.map(drop)])?;

        let proceed = outcome == Some(true) && hook_ok && ensure_ok;
        if !proceed {
            debug!(?outcome, hook_ok, ensure_ok, "not continuing to next step");
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(ExecError::Interrupted);
        }

        let next = self.next.insert(self.plan.next.using(&self.state));
        next.run(cancel).await
    }

    fn succeeded(&self) -> Option<bool> {
        match &self.next {
            Some(next) => next.succeeded(),
            None => Some(false),
        }
    }

    async fn release(&mut self) -> Result<()> {
        release_all(
            self.step
                .iter_mut()
                .chain(self.hook.iter_mut())
                .chain(self.ensure.iter_mut())
                .chain(self.next.iter_mut())
                .collect(),
        )
        .await
    }
}
