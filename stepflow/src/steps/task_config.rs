//! Task configuration and where it comes from.
//!
//! This module provides:
//! - [`TaskConfig`], the serde model of a task definition
//! - The [`TaskConfigSource`] contract with static, file, merged and
//!   validating implementations

use crate::artifact::{read_all, ArtifactRepository, ArtifactSource};
use crate::errors::{ExecError, Result, UnknownArtifactSourceError, UnspecifiedArtifactSourceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// The image a task container is built from, fetched through a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    /// Resource type providing the image.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource source configuration.
    #[serde(default)]
    pub source: Value,
}

/// A named input of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Artifact name.
    pub name: String,
    /// Directory under the artifacts root; the name when empty.
    #[serde(default)]
    pub path: String,
    /// Absent optional inputs are skipped instead of reported missing.
    #[serde(default)]
    pub optional: bool,
}

impl TaskInput {
    /// Creates a required input.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: String::new(),
            optional: false,
        }
    }

    /// Places the input at `path` instead of its name.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Marks the input optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// The directory the input lives in, relative to the artifacts root.
    #[must_use]
    pub fn dir(&self) -> &str {
        if self.path.is_empty() {
            &self.name
        } else {
            &self.path
        }
    }
}

/// A named output of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Artifact name.
    pub name: String,
    /// Directory under the artifacts root; the name when empty.
    #[serde(default)]
    pub path: String,
}

impl TaskOutput {
    /// Creates an output.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: String::new(),
        }
    }

    /// The directory the output lives in, relative to the artifacts root.
    #[must_use]
    pub fn dir(&self) -> &str {
        if self.path.is_empty() {
            &self.name
        } else {
            &self.path
        }
    }
}

/// What to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Executable path.
    #[serde(default)]
    pub path: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory, relative to the artifacts root.
    #[serde(default)]
    pub dir: String,
    /// User to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A task definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Required worker platform.
    #[serde(default)]
    pub platform: String,
    /// Image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Image fetched through a resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource: Option<ImageResource>,
    /// Parameters exported to the process environment.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// What to execute.
    #[serde(default)]
    pub run: RunConfig,
    /// Inputs.
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    /// Outputs.
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
}

impl TaskConfig {
    /// Parses a YAML (or JSON) task definition.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yml::from_str(text).map_err(|e| ExecError::InvalidTaskConfig(e.to_string()))
    }

    /// Renders `params` as sorted `KEY=VALUE` entries.
    ///
    /// Strings are used verbatim, anything else as its JSON text.
    #[must_use]
    pub fn params_env(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}={s}"),
                Value::Null => format!("{key}="),
                other => format!("{key}={other}"),
            })
            .collect()
    }

    /// Layers `other` over `self`.
    ///
    /// Params are merged key by key with `other` winning. Every other field
    /// is taken from `other` when `other` sets it.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        if !other.platform.is_empty() {
            self.platform = other.platform;
        }
        if other.image.is_some() {
            self.image = other.image;
        }
        if other.image_resource.is_some() {
            self.image_resource = other.image_resource;
        }
        self.params.extend(other.params);
        if !other.run.path.is_empty() {
            self.run = other.run;
        }
        if !other.inputs.is_empty() {
            self.inputs = other.inputs;
        }
        if !other.outputs.is_empty() {
            self.outputs = other.outputs;
        }
        self
    }

    /// Checks the definition is complete.
    ///
    /// Every problem is reported in one error.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.platform.is_empty() {
            problems.push("missing 'platform'".to_string());
        }
        if self.run.path.is_empty() {
            problems.push("missing path to executable to run".to_string());
        }

        let mut seen = HashSet::new();
        for (i, input) in self.inputs.iter().enumerate() {
            if input.name.is_empty() {
                problems.push(format!("input in position {i} has no name"));
            } else if !seen.insert(input.name.as_str()) {
                problems.push(format!("input '{}' is declared more than once", input.name));
            }
        }

        let mut seen = HashSet::new();
        for (i, output) in self.outputs.iter().enumerate() {
            if output.name.is_empty() {
                problems.push(format!("output in position {i} has no name"));
            } else if !seen.insert(output.name.as_str()) {
                problems.push(format!("output '{}' is declared more than once", output.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ExecError::InvalidTaskConfig(problems.join("; ")))
        }
    }
}

/// Resolves the configuration of a task right before it runs.
#[async_trait]
pub trait TaskConfigSource: Send + Sync {
    /// Produces the configuration, reading artifacts from `repo` if needed.
    async fn fetch_config(&self, repo: &ArtifactRepository) -> Result<TaskConfig>;
}

/// A configuration given inline in the plan.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    config: TaskConfig,
    params: BTreeMap<String, Value>,
}

impl StaticConfigSource {
    /// Serves `config`.
    #[must_use]
    pub fn new(config: TaskConfig) -> Self {
        Self {
            config,
            params: BTreeMap::new(),
        }
    }

    /// Overrides params of the served configuration.
    #[must_use]
    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }
}

#[async_trait]
impl TaskConfigSource for StaticConfigSource {
    async fn fetch_config(&self, _repo: &ArtifactRepository) -> Result<TaskConfig> {
        let mut config = self.config.clone();
        config.params.extend(self.params.clone());
        Ok(config)
    }
}

/// A configuration file inside an artifact, addressed as
/// `artifact/path/to/task.yml`.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: String,
}

impl FileConfigSource {
    /// Reads the configuration from `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskConfigSource for FileConfigSource {
    async fn fetch_config(&self, repo: &ArtifactRepository) -> Result<TaskConfig> {
        let Some((name, file)) = self.path.split_once('/') else {
            return Err(UnspecifiedArtifactSourceError::new(&self.path).into());
        };

        let source = repo
            .source_for(name)
            .ok_or_else(|| UnknownArtifactSourceError::new(name))?;

        debug!(artifact = name, file, "loading task config");
        let bytes = read_all(source.stream_file(file).await?).await?;
        let text = String::from_utf8(bytes).map_err(|e| {
            ExecError::InvalidTaskConfig(format!("{} is not valid UTF-8: {e}", self.path))
        })?;

        TaskConfig::from_yaml(&text).map_err(|err| match err {
            ExecError::InvalidTaskConfig(msg) => {
                ExecError::InvalidTaskConfig(format!("failed to parse {}: {msg}", self.path))
            }
            other => other,
        })
    }
}

/// Layers one source over another.
#[derive(Clone)]
pub struct MergedConfigSource {
    base: Arc<dyn TaskConfigSource>,
    overlay: Arc<dyn TaskConfigSource>,
}

impl MergedConfigSource {
    /// Layers `overlay` over `base`.
    #[must_use]
    pub fn new(base: Arc<dyn TaskConfigSource>, overlay: Arc<dyn TaskConfigSource>) -> Self {
        Self { base, overlay }
    }
}

#[async_trait]
impl TaskConfigSource for MergedConfigSource {
    async fn fetch_config(&self, repo: &ArtifactRepository) -> Result<TaskConfig> {
        let base = self.base.fetch_config(repo).await?;
        let overlay = self.overlay.fetch_config(repo).await?;
        Ok(base.merge(overlay))
    }
}

/// Rejects incomplete configurations from the wrapped source.
#[derive(Clone)]
pub struct ValidatingConfigSource {
    inner: Arc<dyn TaskConfigSource>,
}

impl ValidatingConfigSource {
    /// Validates whatever `inner` produces.
    #[must_use]
    pub fn new(inner: Arc<dyn TaskConfigSource>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TaskConfigSource for ValidatingConfigSource {
    async fn fetch_config(&self, repo: &ArtifactRepository) -> Result<TaskConfig> {
        let config = self.inner.fetch_config(repo).await?;
        config.validate()?;
        Ok(config)
    }
}
