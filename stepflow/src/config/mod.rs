//! Configuration for step execution.

use crate::errors::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings shared by every step of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// In-container directory under which task inputs and outputs live.
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: String,
    /// How long an interrupted process gets between SIGTERM and SIGKILL.
    #[serde(default = "default_sigterm_grace_ms")]
    pub sigterm_grace_ms: u64,
    /// Path of the resource `in` script.
    #[serde(default = "default_resource_in_path")]
    pub resource_in_path: String,
    /// Path of the resource `out` script.
    #[serde(default = "default_resource_out_path")]
    pub resource_out_path: String,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_artifacts_root() -> String {
    "/tmp/build/exec".to_string()
}

fn default_sigterm_grace_ms() -> u64 {
    10_000
}

fn default_resource_in_path() -> String {
    "/opt/resource/in".to_string()
}

fn default_resource_out_path() -> String {
    "/opt/resource/out".to_string()
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            artifacts_root: default_artifacts_root(),
            sigterm_grace_ms: default_sigterm_grace_ms(),
            resource_in_path: default_resource_in_path(),
            resource_out_path: default_resource_out_path(),
            log: LogConfig::default(),
        }
    }
}

impl ExecConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Io(std::io::Error::new(
                e.kind(),
                format!("reading {}: {e}", path.display()),
            ))
        })?;
        Self::from_json(&text)
    }

    /// Sets the artifacts root.
    #[must_use]
    pub fn with_artifacts_root(mut self, root: impl Into<String>) -> Self {
        self.artifacts_root = root.into();
        self
    }

    /// Sets the SIGTERM grace period.
    #[must_use]
    pub fn with_sigterm_grace(mut self, grace: Duration) -> Self {
        self.sigterm_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the resource script paths.
    #[must_use]
    pub fn with_resource_paths(mut self, in_path: impl Into<String>, out_path: impl Into<String>) -> Self {
        self.resource_in_path = in_path.into();
        self.resource_out_path = out_path.into();
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// The SIGTERM grace period.
    #[must_use]
    pub fn sigterm_grace(&self) -> Duration {
        Duration::from_millis(self.sigterm_grace_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when the environment sets none.
    #[serde(default = "default_level")]
    pub level: String,
    /// Environment variable holding a filter directive.
    #[serde(default = "default_env_var")]
    pub env_var: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_env_var() -> String {
    "STEPFLOW_LOG".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            env_var: default_env_var(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Sets the default level.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Switches JSON output on or off.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ExecConfig::default();
        assert_eq!(config.artifacts_root, "/tmp/build/exec");
        assert_eq!(config.sigterm_grace(), Duration::from_secs(10));
        assert_eq!(config.resource_in_path, "/opt/resource/in");
        assert_eq!(config.resource_out_path, "/opt/resource/out");
        assert_eq!(config.log.env_var, "STEPFLOW_LOG");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = ExecConfig::from_json(r#"{"sigterm_grace_ms": 250, "log": {"json": true}}"#).unwrap();
        assert_eq!(config.sigterm_grace(), Duration::from_millis(250));
        assert_eq!(config.artifacts_root, "/tmp/build/exec");
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_json() {
        let err = ExecConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ExecError::Serialization(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"artifacts_root": "/scratch"}}"#).unwrap();

        let config = ExecConfig::from_file(file.path()).unwrap();
        assert_eq!(config.artifacts_root, "/scratch");
    }

    #[test]
    fn test_missing_file() {
        let err = ExecConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ExecError::Io(_)));
    }

    #[test]
    fn test_builders() {
        let config = ExecConfig::new()
            .with_artifacts_root("/work")
            .with_sigterm_grace(Duration::from_millis(5))
            .with_resource_paths("/in", "/out")
            .with_log(LogConfig::default().with_level("debug").with_json(true));
        assert_eq!(config.artifacts_root, "/work");
        assert_eq!(config.sigterm_grace_ms, 5);
        assert_eq!(config.resource_out_path, "/out");
        assert_eq!(config.log.level, "debug");
    }
}
