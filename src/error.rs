//! Error types for trueno-sweep
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Sweep-level errors (`Definition`, `RepositoryWrite`) name the offending
//! experiment or run. Per-run errors are contained by the runner and end up
//! as the `error` field of a failed run record.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-sweep error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed experiment definition (the whole set is rejected)
    #[error("Invalid experiment definition '{experiment}' at key '{key}': {message}")]
    Definition {
        /// Experiment name (or `<root>` for the document itself)
        experiment: String,
        /// Offending key
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Fit/predict failure for a single experiment spec
    #[error("Run of experiment '{experiment_id}' failed: {message}")]
    RunExecution {
        /// Experiment spec that failed
        experiment_id: String,
        /// Failure summary
        message: String,
    },

    /// Estimator adapter error (bad input shape, singular system, ...)
    #[error("Estimator error: {0}")]
    Estimator(String),

    /// Metric could not be computed on a partition
    #[error("Metric '{metric}' undefined: {message}")]
    Metric {
        /// Metric name
        metric: String,
        /// Reason (degenerate partition, negative values, ...)
        message: String,
    },

    /// Repository append failed after exhausting retries
    #[error("Repository write failed for run {run_id} after {attempts} attempt(s): {message}\nThe sweep was aborted; completed runs are preserved.")]
    RepositoryWrite {
        /// Run that could not be persisted
        run_id: String,
        /// Attempts made
        attempts: u32,
        /// Last storage error
        message: String,
    },

    /// Appending a record whose `run_id` is already stored
    #[error("Run id already exists: {0}\nRun records are immutable; re-run the experiment to supersede it.")]
    DuplicateRunId(String),

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage error (run log, artifacts, Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Storage temporarily unavailable; the operation may succeed on retry
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a definition error for `experiment` at `key`.
    pub fn definition(
        experiment: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Definition {
            experiment: experiment.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether a failed append may succeed when retried.
    ///
    /// Only IO failures and `StorageUnavailable` qualify.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_names_experiment_and_key() {
        let err = Error::definition("gbm-depth", "grid.depth", "empty value list");
        let msg = err.to_string();
        assert!(msg.contains("gbm-depth"));
        assert!(msg.contains("grid.depth"));
        assert!(msg.contains("empty value list"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::StorageUnavailable("disk busy".into()).is_transient());
        assert!(!Error::StorageError("lock poisoned".into()).is_transient());
        assert!(Error::Io(std::io::Error::other("eio")).is_transient());
        assert!(!Error::DuplicateRunId("r1".into()).is_transient());
        assert!(!Error::InvalidInput("x".into()).is_transient());
    }
}
