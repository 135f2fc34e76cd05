//! Final build status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The final status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Every step that reported an outcome succeeded.
    Succeeded,
    /// The plan ran to completion but some step reported failure.
    Failed,
    /// An infrastructure error aborted the build.
    Errored,
    /// The build was cancelled.
    Aborted,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

impl BuildStatus {
    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_display() {
        assert_eq!(BuildStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(BuildStatus::Failed.to_string(), "failed");
        assert_eq!(BuildStatus::Errored.to_string(), "errored");
        assert_eq!(BuildStatus::Aborted.to_string(), "aborted");
    }

    #[test]
    fn test_build_status_serde() {
        let json = serde_json::to_string(&BuildStatus::Aborted).unwrap();
        assert_eq!(json, "\"aborted\"");
    }
}
