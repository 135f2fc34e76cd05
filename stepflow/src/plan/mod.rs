//! The declarative plan tree and its compilation into steps.
//!
//! This module provides:
//! - [`Plan`], a serde tree of step configurations keyed by plan id
//! - [`StepBuilder`], which compiles a plan into a [`StepFactory`] tree
//!   wired to the worker pool, resource fetcher and credential lookup
//!
//! [`StepFactory`]: crate::step::StepFactory

mod builder;

pub use builder::{DelegateFactory, StepBuilder};

use crate::core::{PlanId, Version};
use crate::errors::Result;
use crate::resource::ResourceTypes;
use crate::steps::TaskConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;

/// One node of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique id of the node within the build.
    pub id: PlanId,
    /// What the node does.
    pub step: PlanStep,
}

impl Plan {
    /// Creates a plan node.
    #[must_use]
    pub fn new(id: impl Into<PlanId>, step: PlanStep) -> Self {
        Self { id: id.into(), step }
    }

    /// Parses a plan from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// The kinds of plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    /// Fetch a resource version.
    Get(GetPlan),
    /// Publish through a resource.
    Put(PutPlan),
    /// Run a task.
    Task(TaskPlan),
    /// Run children in sequence.
    Do(Vec<Plan>),
    /// Run children concurrently.
    Aggregate(Vec<Plan>),
    /// Try children in order until one succeeds.
    Retry(Vec<Plan>),
    /// Bound a step by a deadline.
    Timeout(TimeoutPlan),
    /// Run a hook when a step succeeds.
    OnSuccess(HookPlan),
    /// Run a hook when a step fails.
    OnFailure(HookPlan),
    /// Run a hook when a step is interrupted.
    OnAbort(HookPlan),
    /// Always run a hook after a step.
    Ensure(HookPlan),
    /// Absorb every outcome except interruption.
    Try(Box<Plan>),
    /// A step with success, failure and ensure hooks and a continuation.
    Hooked(HookedPlan),
    /// Register an externally supplied stream as an artifact.
    ArtifactInput(ArtifactInputPlan),
    /// Hand an artifact to an external receiver.
    ArtifactOutput(ArtifactOutputPlan),
}

/// Configuration of a get step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Artifact name the fetched version is registered under.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source configuration, may contain `((vars))`.
    #[serde(default)]
    pub source: Value,
    /// Fetch params, may contain `((vars))`.
    #[serde(default)]
    pub params: Value,
    /// A pinned version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// Take the version an upstream put stored under this plan id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<PlanId>,
    /// Required worker tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Custom resource types in scope.
    #[serde(default)]
    pub resource_types: ResourceTypes,
}

/// Configuration of a put step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    /// Display name.
    pub name: String,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source configuration, may contain `((vars))`.
    #[serde(default)]
    pub source: Value,
    /// Put params, may contain `((vars))`.
    #[serde(default)]
    pub params: Value,
    /// Artifacts to hand over; every artifact when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    /// Required worker tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Custom resource types in scope.
    #[serde(default)]
    pub resource_types: ResourceTypes,
}

/// Configuration of a task step.
///
/// At least one of `config` and `config_path` must be given. With both, the
/// inline config is layered over the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Display name.
    pub name: String,
    /// Inline task configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    /// `artifact/path/to/task.yml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    /// Params overriding the configuration's.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// Run privileged.
    #[serde(default)]
    pub privileged: bool,
    /// Required worker tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Task input name to artifact name.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    /// Task output name to artifact name.
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
    /// Artifact to use as the container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Custom resource types in scope.
    #[serde(default)]
    pub resource_types: ResourceTypes,
}

/// A step bounded by a deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPlan {
    /// The bounded step.
    pub step: Box<Plan>,
    /// The deadline, e.g. `"1h30m"`, `"90s"` or `"250ms"`.
    pub duration: String,
}

/// A step and its conditional hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPlan {
    /// The hooked step.
    pub step: Box<Plan>,
    /// The hook.
    pub hook: Box<Plan>,
}

/// A step with every hook and a continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookedPlan {
    /// The hooked step.
    pub step: Box<Plan>,
    /// Runs once the step and its hooks succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Box<Plan>>,
    /// Runs when the step succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<Plan>>,
    /// Runs when the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<Plan>>,
    /// Always runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Box<Plan>>,
}

/// Receives an upload on the node's rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInputPlan {
    /// Artifact name to register.
    pub name: String,
}

/// Sends an artifact on the node's rendezvous point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactOutputPlan {
    /// The artifact to send.
    pub artifact: String,
    /// Send only this file of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[allow(clippy::unwrap_used)]
static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").unwrap());

/// Parses durations such as `"1h30m"`, `"45s"` or `"250ms"`.
///
/// Returns `None` unless the whole text is a sequence of amount/unit pairs.
#[must_use]
pub fn parse_duration(text: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in DURATION_PART.captures_iter(text) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
        total += match caps.get(2)?.as_str() {
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "s" => Duration::from_secs(amount),
            _ => Duration::from_millis(amount),
        };
    }

    (consumed != 0 && consumed == text.len()).then_some(total)
}
