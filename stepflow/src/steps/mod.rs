//! Primitive steps: the side-effecting leaves of a plan.
//!
//! This module provides:
//! - [`GetStep`], fetching a resource version into the artifact repository
//! - [`PutStep`], publishing artifacts through a resource
//! - [`TaskStep`], running a task in a container and collecting its outputs
//! - [`ArtifactInputStep`] and [`ArtifactOutputStep`], bridging externally
//!   supplied or consumed byte streams into the artifact repository
//!
//! Every primitive step reports its infrastructure errors to its delegate
//! before they propagate.

mod artifact_io;
mod get;
mod put;
mod task;
mod task_config;

pub use artifact_io::{ArtifactInputStep, ArtifactOutputStep};
pub use get::{GetStep, VersionSource};
pub use put::{PutInputs, PutStep};
pub use task::{TaskStep, TASK_EXIT_STATUS_PROPERTY, TASK_PROCESS_PROPERTY};
pub use task_config::{
    FileConfigSource, ImageResource, MergedConfigSource, RunConfig, StaticConfigSource, TaskConfig,
    TaskConfigSource, TaskInput, TaskOutput, ValidatingConfigSource,
};

use crate::cancellation::CancellationToken;
use crate::errors::{ExecError, Result};
use crate::worker::{Process, Signal};
use std::time::Duration;
use tracing::{info, warn};

/// Waits for `process` to exit, or stops it once `cancel` fires.
///
/// On cancellation the process gets SIGTERM, then SIGKILL if it is still
/// running after `grace`. The result is then always
/// [`ExecError::Interrupted`].
pub(crate) async fn wait_or_stop(
    process: &dyn Process,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<i32> {
    tokio::select! {
        status = process.wait() => return status,
        () = cancel.cancelled() => {}
    }

    info!(process = %process.id(), "interrupted, terminating process");
    if let Err(err) = process.signal(Signal::Terminate).await {
        warn!(error = %err, "failed to deliver SIGTERM");
    }

    if tokio::time::timeout(grace, process.wait()).await.is_err() {
        warn!(grace_ms = grace.as_millis(), "process outlived grace period, killing");
        if let Err(err) = process.signal(Signal::Kill).await {
            warn!(error = %err, "failed to deliver SIGKILL");
        }
        if let Err(err) = process.wait().await {
            warn!(error = %err, "lost track of killed process");
        }
    }

    Err(ExecError::Interrupted)
}
