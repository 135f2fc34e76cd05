//! Error types for step execution.
//!
//! Errors and the boolean success outcome of a step are orthogonal. An error
//! means the branch could not be carried out (infrastructure failure, invalid
//! configuration, cancellation) and aborts it. An action whose process ran to
//! completion but reported failure is not an error: it surfaces as
//! `Step::succeeded() == Some(false)`.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = ExecError> = std::result::Result<T, E>;

/// The main error type for step execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Cancellation was observed and honored.
    #[error("interrupted")]
    Interrupted,

    /// One or more task inputs are not present in the artifact repository.
    #[error("{0}")]
    MissingInputs(#[from] MissingInputsError),

    /// An artifact name was requested that nothing registered.
    #[error("{0}")]
    UnknownArtifactSource(#[from] UnknownArtifactSourceError),

    /// A path did not name the artifact it lives in.
    #[error("{0}")]
    UnspecifiedArtifactSource(#[from] UnspecifiedArtifactSourceError),

    /// A file could not be located inside an artifact.
    #[error("{0}")]
    FileNotFound(#[from] FileNotFoundError),

    /// The artifact a task wanted to use as its image is not registered.
    #[error("{0}")]
    MissingTaskImageSource(#[from] MissingTaskImageSourceError),

    /// Credential placeholders could not be resolved.
    #[error("{0}")]
    UndefinedVariables(#[from] UndefinedVariablesError),

    /// Several errors collected at a join point.
    #[error("{0}")]
    Aggregate(#[from] AggregateError),

    /// A get step expected a version from a put step that has not stored one.
    #[error("version for put step '{plan_id}' is missing")]
    PutVersionMissing {
        /// Plan id of the put step.
        plan_id: String,
    },

    /// A resource script exited nonzero.
    ///
    /// Steps translate this into `succeeded() == Some(false)`; it only
    /// escapes as an error from collaborator calls.
    #[error("resource script failed: exit status {exit_status}")]
    ResourceScriptFailed {
        /// The script's exit status.
        exit_status: i32,
        /// Captured stderr of the script, if any.
        stderr: String,
    },

    /// A task configuration is malformed or incomplete.
    #[error("invalid task configuration: {0}")]
    InvalidTaskConfig(String),

    /// A plan could not be compiled into steps.
    #[error("invalid plan '{plan_id}': {message}")]
    InvalidPlan {
        /// The offending plan node.
        plan_id: String,
        /// What is wrong with it.
        message: String,
    },

    /// A second stream was offered for a rendezvous point already in use.
    #[error("a stream is already pending for plan '{plan_id}'")]
    RendezvousBusy {
        /// The rendezvous key.
        plan_id: String,
    },

    /// A worker or container operation failed.
    #[error("worker error: {0}")]
    Worker(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// An error raised by a collaborator implementation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// Returns true if this error means "stopped due to cancellation".
    ///
    /// An aggregate counts as interrupted when every member is.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::Aggregate(agg) => {
                !agg.errors.is_empty() && agg.errors.iter().all(Self::is_interrupted)
            }
            _ => false,
        }
    }

    /// Collapses a list of errors into at most one.
    ///
    /// Zero errors yield `None`, a single error is returned as is, and more
    /// are wrapped in an [`AggregateError`]. Nested aggregates are flattened.
    #[must_use]
    pub fn aggregate(errors: Vec<Self>) -> Option<Self> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Self::Aggregate(agg) => flat.extend(agg.errors),
                other => flat.push(other),
            }
        }

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Self::Aggregate(AggregateError { errors: flat })),
        }
    }

    /// Joins an optional primary error with further errors.
    pub fn join(first: Result<()>, rest: impl IntoIterator<Item = Result<()>>) -> Result<()> {
        let errors: Vec<Self> = std::iter::once(first)
            .chain(rest)
            .filter_map(Result::err)
            .collect();

        match Self::aggregate(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Creates a worker error.
    #[must_use]
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Creates an invalid plan error.
    #[must_use]
    pub fn invalid_plan(plan_id: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidPlan {
            plan_id: plan_id.to_string(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Returned when any of a task's required inputs are missing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing inputs: {}", inputs.join(", "))]
pub struct MissingInputsError {
    /// Every input name that could not be found.
    pub inputs: Vec<String>,
}

impl MissingInputsError {
    /// Creates a new missing inputs error.
    #[must_use]
    pub fn new(inputs: Vec<String>) -> Self {
        Self { inputs }
    }
}

/// Returned when an artifact name is not registered in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown artifact source: {name}")]
pub struct UnknownArtifactSourceError {
    /// The requested artifact name.
    pub name: String,
}

impl UnknownArtifactSourceError {
    /// Creates a new unknown artifact source error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Returned when a path is not qualified with the artifact it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("config path '{path}' does not specify where the file lives")]
pub struct UnspecifiedArtifactSourceError {
    /// The unqualified path.
    pub path: String,
}

impl UnspecifiedArtifactSourceError {
    /// Creates a new unspecified artifact source error.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Returned when a file cannot be found inside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("file not found: {path}")]
pub struct FileNotFoundError {
    /// The path that was requested.
    pub path: String,
}

impl FileNotFoundError {
    /// Creates a new file not found error.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Returned when a task's image artifact is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "missing image artifact source: {name}\nmake sure there's a corresponding 'get' step, or a task that produces it as an output"
)]
pub struct MissingTaskImageSourceError {
    /// The image artifact name.
    pub name: String,
}

impl MissingTaskImageSourceError {
    /// Creates a new missing image source error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Returned when credential placeholders have no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undefined vars: {}", names.join(", "))]
pub struct UndefinedVariablesError {
    /// Every variable name that could not be resolved.
    pub names: Vec<String>,
}

/// Several errors collected at a join point.
///
/// The message lists every root cause so none is masked by another.
#[derive(Debug)]
pub struct AggregateError {
    /// The collected errors, in the order they were encountered.
    pub errors: Vec<ExecError>,
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_inputs_lists_every_name() {
        let err = MissingInputsError::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "missing inputs: a, b");
    }

    #[test]
    fn test_aggregate_collapses() {
        assert!(ExecError::aggregate(Vec::new()).is_none());

        let single = ExecError::aggregate(vec![ExecError::internal("boom")]).unwrap();
        assert!(matches!(single, ExecError::Internal(_)));

        let many = ExecError::aggregate(vec![
            ExecError::internal("first"),
            ExecError::worker("second"),
        ])
        .unwrap();
        let text = many.to_string();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_aggregate_flattens_nested() {
        let inner = ExecError::aggregate(vec![
            ExecError::internal("a"),
            ExecError::internal("b"),
        ])
        .unwrap();
        let outer = ExecError::aggregate(vec![inner, ExecError::internal("c")]).unwrap();

        match outer {
            ExecError::Aggregate(agg) => assert_eq!(agg.errors.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_is_interrupted() {
        assert!(ExecError::Interrupted.is_interrupted());
        assert!(!ExecError::internal("x").is_interrupted());

        let all = ExecError::aggregate(vec![ExecError::Interrupted, ExecError::Interrupted]).unwrap();
        assert!(all.is_interrupted());

        let mixed =
            ExecError::aggregate(vec![ExecError::Interrupted, ExecError::internal("x")]).unwrap();
        assert!(!mixed.is_interrupted());
    }

    #[test]
    fn test_join() {
        assert!(ExecError::join(Ok(()), vec![Ok(()), Ok(())]).is_ok());

        let err = ExecError::join(Err(ExecError::internal("e1")), vec![Err(ExecError::internal("e2"))])
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("e1") && text.contains("e2"));
    }
}
