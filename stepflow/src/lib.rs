//! # Stepflow
//!
//! The step-execution core of a CI/CD pipeline orchestrator.
//!
//! A pipeline job compiles to a plan: a tree of primitive actions (fetch a
//! resource version, run a task, publish a resource version) wired together
//! with control-flow combinators. Stepflow turns that static plan into a
//! live, cancellable, concurrently executing tree of steps with:
//!
//! - **Cooperative cancellation**: one token forwarded through every
//!   combinator, with hooks that still run after an abort
//! - **Deterministic hooks**: success, failure, abort and ensure hooks fire
//!   according to how a branch terminated
//! - **Artifact threading**: a concurrency-safe repository passing build
//!   artifacts from producers to consumers across workers
//! - **Orthogonal outcomes**: infrastructure errors abort a branch, while a
//!   process that ran and failed is a `false` outcome hooks can react to
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stepflow::prelude::*;
//!
//! let builder = StepBuilder::new(workers, fetcher).with_config(ExecConfig::default());
//! let plan = Plan::from_json(&plan_json)?;
//!
//! let state = Arc::new(RunState::new());
//! let outcome = run_plan(&builder, &plan, &metadata, &state, &CancellationToken::new()).await?;
//! println!("build {}", outcome.status);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifact;
pub mod cancellation;
pub mod combinators;
pub mod config;
pub mod core;
pub mod creds;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod plan;
pub mod resource;
pub mod state;
pub mod step;
pub mod steps;
pub mod testing;
pub mod worker;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifact::{ArtifactDestination, ArtifactRepository, ArtifactSource, ByteStream};
    pub use crate::cancellation::{interruptible, CancellationToken};
    pub use crate::combinators::{
        Aggregate, Compose, Ensure, HookedCompose, Identity, OnAbort, OnFailure, OnSuccess, Retry,
        Timeout, Try,
    };
    pub use crate::config::{ExecConfig, LogConfig};
    pub use crate::core::{BuildStatus, ExitStatus, MetadataField, PlanId, Version, VersionInfo};
    pub use crate::creds::{StaticVariables, Variables};
    pub use crate::engine::{run_build, run_plan, BuildOutcome};
    pub use crate::errors::{ExecError, Result};
    pub use crate::events::{BuildStepDelegate, LoggingDelegate, NoOpDelegate, OutputSink};
    pub use crate::observability::init_logging;
    pub use crate::plan::{Plan, PlanStep, StepBuilder};
    pub use crate::resource::{ResourceFetcher, VersionedSource};
    pub use crate::state::RunState;
    pub use crate::step::{run_once, Step, StepContext, StepFactory, StepMetadata, SuccessReporter};
    pub use crate::steps::{ArtifactInputStep, ArtifactOutputStep, GetStep, PutStep, TaskStep};
    pub use crate::worker::{Container, WorkerClient};
}
