//! The Build Step Delegate: the observability callbacks a step drives.

use super::output::{BufferSink, NullSink, OutputSink, TracingSink};
use crate::core::{ExitStatus, VersionInfo};
use crate::errors::ExecError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Lifecycle callbacks for one step.
///
/// Calls are fire-and-forget: a delegate must never block the step or fail.
pub trait BuildStepDelegate: Send + Sync {
    /// The step is preparing its container.
    fn initializing(&self);

    /// The step's process has been started.
    fn started(&self);

    /// The step's process exited, possibly producing a version.
    fn completed(&self, status: ExitStatus, version: Option<&VersionInfo>);

    /// The step hit an infrastructure error.
    fn failed(&self, err: &ExecError);

    /// Sink for the process's stdout.
    fn stdout(&self) -> Arc<dyn OutputSink>;

    /// Sink for the process's stderr.
    fn stderr(&self) -> Arc<dyn OutputSink>;
}

/// A delegate that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDelegate;

impl BuildStepDelegate for NoOpDelegate {
    fn initializing(&self) {}

    fn started(&self) {}

    fn completed(&self, _status: ExitStatus, _version: Option<&VersionInfo>) {}

    fn failed(&self, _err: &ExecError) {}

    fn stdout(&self) -> Arc<dyn OutputSink> {
        Arc::new(NullSink)
    }

    fn stderr(&self) -> Arc<dyn OutputSink> {
        Arc::new(NullSink)
    }
}

/// A delegate that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingDelegate {
    name: String,
    level: Level,
}

impl LoggingDelegate {
    /// Creates a logging delegate for the named step.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            level: Level::INFO,
        }
    }

    /// Logs lifecycle events at debug level instead of info.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    fn log_event(&self, event: &str, detail: Option<String>) {
        let detail = detail.unwrap_or_default();
        if self.level == Level::DEBUG {
            tracing::debug!(step = %self.name, event, detail = %detail, "step {}", event);
        } else {
            info!(step = %self.name, event, detail = %detail, "step {}", event);
        }
    }
}

impl BuildStepDelegate for LoggingDelegate {
    fn initializing(&self) {
        self.log_event("initializing", None);
    }

    fn started(&self) {
        self.log_event("started", None);
    }

    fn completed(&self, status: ExitStatus, version: Option<&VersionInfo>) {
        let detail = match version {
            Some(v) => format!("exit_status={status} version={:?}", v.version),
            None => format!("exit_status={status}"),
        };
        self.log_event("completed", Some(detail));
    }

    fn failed(&self, err: &ExecError) {
        error!(step = %self.name, error = %err, "step failed");
    }

    fn stdout(&self) -> Arc<dyn OutputSink> {
        Arc::new(TracingSink::stdout())
    }

    fn stderr(&self) -> Arc<dyn OutputSink> {
        Arc::new(TracingSink::stderr())
    }
}

/// One event recorded by a [`CollectingDelegate`].
#[derive(Debug, Clone)]
pub struct DelegateEvent {
    /// Event kind, e.g. `"step.completed"`.
    pub kind: String,
    /// Event payload.
    pub data: Option<serde_json::Value>,
    /// When the event was recorded.
    pub at: DateTime<Utc>,
}

/// A collecting delegate for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingDelegate {
    events: RwLock<Vec<DelegateEvent>>,
    stdout: Arc<BufferSink>,
    stderr: Arc<BufferSink>,
}

impl CollectingDelegate {
    /// Creates a new collecting delegate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.read().clone()
    }

    /// Returns the kinds of all collected events, in order.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.kind.clone()).collect()
    }

    /// Returns events matching a kind prefix.
    #[must_use]
    pub fn events_of_kind(&self, prefix: &str) -> Vec<DelegateEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Returns everything written to stdout.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        self.stdout.text()
    }

    /// Returns everything written to stderr.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        self.stderr.text()
    }

    fn record(&self, kind: &str, data: Option<serde_json::Value>) {
        self.events.write().push(DelegateEvent {
            kind: kind.to_string(),
            data,
            at: Utc::now(),
        });
    }
}

impl BuildStepDelegate for CollectingDelegate {
    fn initializing(&self) {
        self.record("step.initializing", None);
    }

    fn started(&self) {
        self.record("step.started", None);
    }

    fn completed(&self, status: ExitStatus, version: Option<&VersionInfo>) {
        self.record(
            "step.completed",
            Some(serde_json::json!({
                "exit_status": status.code(),
                "version": version.map(|v| &v.version),
            })),
        );
    }

    fn failed(&self, err: &ExecError) {
        self.record("step.failed", Some(serde_json::json!({ "error": err.to_string() })));
    }

    fn stdout(&self) -> Arc<dyn OutputSink> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn OutputSink> {
        self.stderr.clone()
    }
}
