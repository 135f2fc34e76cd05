//! Scripted fake steps.

use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::state::RunState;
use crate::step::{Step, StepFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a fake step does when run.
#[derive(Debug, Clone)]
pub enum Script {
    /// Returns no error and reports success.
    Succeed,
    /// Returns no error and reports failure.
    Fail,
    /// Returns no error and reports no outcome.
    NoOutcome,
    /// Returns an internal error with this message.
    Error(String),
    /// Returns the interrupted error straight away.
    Interrupt,
    /// Waits for cancellation, then returns the interrupted error.
    BlockUntilCancelled,
    /// Panics with this message.
    Panic(String),
    /// Sleeps (interruptibly), then follows the inner script.
    Sleep(Duration, Box<Script>),
}

/// Shared call counters.
#[derive(Debug, Default)]
pub struct StepCounters {
    using: AtomicUsize,
    run: AtomicUsize,
    release: AtomicUsize,
}

impl StepCounters {
    /// Times a step was bound.
    #[must_use]
    pub fn using_count(&self) -> usize {
        self.using.load(Ordering::SeqCst)
    }

    /// Times a step was run.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.run.load(Ordering::SeqCst)
    }

    /// Times a step was released.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.release.load(Ordering::SeqCst)
    }
}

/// An ordered log of `"<name>.start"` / `"<name>.end"` entries shared by
/// several fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    /// Returns every entry in order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Returns the position of `entry`, if recorded.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    /// Returns true if `entry` was recorded.
    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

/// A step that follows a [`Script`].
pub struct FakeStep {
    script: Script,
    error: Option<ExecError>,
    release_error: Option<String>,
    counters: Arc<StepCounters>,
    journal: Option<(String, Journal)>,
    succeeded: Option<bool>,
}

impl FakeStep {
    /// Creates a step following `script`.
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            error: None,
            release_error: None,
            counters: Arc::new(StepCounters::default()),
            journal: None,
            succeeded: None,
        }
    }

    /// A step that succeeds.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new(Script::Succeed)
    }

    /// A step that reports failure without error.
    #[must_use]
    pub fn failing() -> Self {
        Self::new(Script::Fail)
    }

    /// A step that returns `err` from its first run.
    #[must_use]
    pub fn erroring(err: ExecError) -> Self {
        let mut step = Self::new(Script::NoOutcome);
        step.error = Some(err);
        step
    }

    /// The step's counters.
    #[must_use]
    pub fn counters(&self) -> Arc<StepCounters> {
        Arc::clone(&self.counters)
    }

    fn with_counters(mut self, counters: Arc<StepCounters>) -> Self {
        self.counters = counters;
        self
    }

    fn with_journal(mut self, journal: Option<(String, Journal)>) -> Self {
        self.journal = journal;
        self
    }

    fn with_release_error(mut self, release_error: Option<String>) -> Self {
        self.release_error = release_error;
        self
    }

    fn note(&self, suffix: &str) {
        if let Some((name, journal)) = &self.journal {
            journal.record(format!("{name}.{suffix}"));
        }
    }
}

async fn perform(script: &Script, cancel: &CancellationToken) -> (Result<()>, Option<bool>) {
    let mut script = script;
    loop {
        match script {
            Script::Succeed => return (Ok(()), Some(true)),
            Script::Fail => return (Ok(()), Some(false)),
            Script::NoOutcome => return (Ok(()), None),
            Script::Error(msg) => return (Err(ExecError::internal(msg.clone())), None),
            Script::Interrupt => return (Err(ExecError::Interrupted), None),
            Script::Panic(msg) => panic!("{msg}"),
            Script::BlockUntilCancelled => {
                cancel.cancelled().await;
                return (Err(ExecError::Interrupted), None);
            }
            Script::Sleep(duration, next) => {
                tokio::select! {
                    () = tokio::time::sleep(*duration) => script = next.as_ref(),
                    () = cancel.cancelled() => return (Err(ExecError::Interrupted), None),
                }
            }
        }
    }
}

#[async_trait]
impl Step for FakeStep {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.counters.run.fetch_add(1, Ordering::SeqCst);
        self.note("start");

        let (res, succeeded) = match self.error.take() {
            Some(err) => (Err(err), None),
            None => perform(&self.script, cancel).await,
        };
        self.succeeded = succeeded;

        self.note("end");
        res
    }

    fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }

    async fn release(&mut self) -> Result<()> {
        self.counters.release.fetch_add(1, Ordering::SeqCst);
        match &self.release_error {
            Some(msg) => Err(ExecError::internal(msg.clone())),
            None => Ok(()),
        }
    }
}

/// A factory producing [`FakeStep`]s that share one set of counters.
#[derive(Clone)]
pub struct FakeStepFactory {
    script: Script,
    release_error: Option<String>,
    counters: Arc<StepCounters>,
    journal: Option<(String, Journal)>,
}

impl FakeStepFactory {
    /// Creates a factory whose steps follow `script`.
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script,
            release_error: None,
            counters: Arc::new(StepCounters::default()),
            journal: None,
        }
    }

    /// Steps succeed.
    #[must_use]
    pub fn succeeding() -> Self {
        Self::new(Script::Succeed)
    }

    /// Steps report failure.
    #[must_use]
    pub fn failing() -> Self {
        Self::new(Script::Fail)
    }

    /// Steps return an internal error.
    #[must_use]
    pub fn erroring(msg: impl Into<String>) -> Self {
        Self::new(Script::Error(msg.into()))
    }

    /// Steps return the interrupted error.
    #[must_use]
    pub fn interrupted() -> Self {
        Self::new(Script::Interrupt)
    }

    /// Steps panic while running.
    #[must_use]
    pub fn panicking(msg: impl Into<String>) -> Self {
        Self::new(Script::Panic(msg.into()))
    }

    /// Steps block until cancelled.
    #[must_use]
    pub fn blocking() -> Self {
        Self::new(Script::BlockUntilCancelled)
    }

    /// Steps sleep for `duration`, then succeed.
    #[must_use]
    pub fn sleeping(duration: Duration) -> Self {
        Self::new(Script::Sleep(duration, Box::new(Script::Succeed)))
    }

    /// Steps report no outcome.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(Script::NoOutcome)
    }

    /// Records start and end of every run under `name`.
    #[must_use]
    pub fn with_journal(mut self, name: impl Into<String>, journal: &Journal) -> Self {
        self.journal = Some((name.into(), journal.clone()));
        self
    }

    /// Makes release fail with `msg`.
    #[must_use]
    pub fn with_release_error(mut self, msg: impl Into<String>) -> Self {
        self.release_error = Some(msg.into());
        self
    }

    /// Wraps the factory for use in a plan.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn StepFactory> {
        Arc::new(self.clone())
    }

    /// The shared counters.
    #[must_use]
    pub fn counters(&self) -> Arc<StepCounters> {
        Arc::clone(&self.counters)
    }

    /// Times a step was bound.
    #[must_use]
    pub fn using_count(&self) -> usize {
        self.counters.using_count()
    }

    /// Times a step was run.
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.counters.run_count()
    }

    /// Times a step was released.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.counters.release_count()
    }
}

impl std::fmt::Debug for FakeStepFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeStepFactory")
            .field("script", &self.script)
            .field("runs", &self.run_count())
            .finish_non_exhaustive()
    }
}

impl StepFactory for FakeStepFactory {
    fn using(&self, _state: &Arc<RunState>) -> Box<dyn Step> {
        self.counters.using.fetch_add(1, Ordering::SeqCst);
        Box::new(
            FakeStep::new(self.script.clone())
                .with_counters(Arc::clone(&self.counters))
                .with_journal(self.journal.clone())
                .with_release_error(self.release_error.clone()),
        )
    }
}
