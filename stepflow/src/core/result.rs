//! Typed values steps store as results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resource version: an opaque string map such as `{"ref": "abc123"}`.
pub type Version = BTreeMap<String, String>;

/// One name/value pair of resource metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name.
    pub name: String,
    /// Field value.
    pub value: String,
}

impl MetadataField {
    /// Creates a metadata field.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The version a Get or Put step produced, with its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// The version.
    pub version: Version,
    /// Metadata reported alongside the version.
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

impl VersionInfo {
    /// Creates version info without metadata.
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            version,
            metadata: Vec::new(),
        }
    }

    /// Adds metadata fields.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Vec<MetadataField>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Exit status of a task or resource process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// Returns true for a zero exit status.
    #[must_use]
    pub const fn success(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ExitStatus {
    fn from(code: i32) -> Self {
        Self(code)
    }
}
