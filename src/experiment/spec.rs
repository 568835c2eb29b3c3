//! Experiment Spec / Experiment Set - expanded, immutable run configurations

use serde::{Deserialize, Serialize};

use super::{Hyperparameters, ValidationPolicy};

/// Target column used when a definition does not name one.
pub const DEFAULT_TARGET: &str = "sales";

/// One concrete configuration to train and validate.
///
/// Produced only by the definition expander; the runner reads it and never
/// mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Unique within the set: `<experiment name>-<ordinal>`
    pub experiment_id: String,
    /// Name of the declaring experiment
    pub experiment_name: String,
    /// Position in declaration order (0-based, stable run numbering)
    pub sequence: usize,
    /// Free-form description carried from the definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Partitioning key, e.g. store type
    pub store_context: String,
    /// Registered estimator kind
    pub estimator_kind: String,
    /// Resolved hyperparameters (validated against the estimator)
    pub hyperparameters: Hyperparameters,
    /// Train/validation split rule
    pub validation_policy: ValidationPolicy,
    /// Feature columns fed to the estimator
    pub features: Vec<String>,
    /// Target column
    pub target: String,
    /// Earlier spec with identical configuration, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
}

impl ExperimentSpec {
    /// Key identifying the resolved configuration (used to flag duplicates).
    pub(crate) fn fingerprint(&self) -> String {
        serde_json::json!({
            "store_context": self.store_context,
            "estimator": self.estimator_kind,
            "hyperparameters": self.hyperparameters,
            "validation": self.validation_policy,
            "features": self.features,
            "target": self.target,
        })
        .to_string()
    }
}

/// Expanded sweep definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSet {
    execution_name: String,
    source_label: String,
    specs: Vec<ExperimentSpec>,
}

impl ExperimentSet {
    pub(crate) fn new(
        execution_name: impl Into<String>,
        source_label: impl Into<String>,
        specs: Vec<ExperimentSpec>,
    ) -> Self {
        Self {
            execution_name: execution_name.into(),
            source_label: source_label.into(),
            specs,
        }
    }

    /// Sweep label grouping the resulting runs.
    #[must_use]
    pub fn execution_name(&self) -> &str {
        &self.execution_name
    }

    /// Provenance of the definition (usually its path).
    #[must_use]
    pub fn source_label(&self) -> &str {
        &self.source_label
    }

    /// Specs in declaration order.
    #[must_use]
    pub fn specs(&self) -> &[ExperimentSpec] {
        &self.specs
    }

    /// Number of specs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True when the set has no specs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Specs flagged as repeating an earlier configuration.
    pub fn duplicates(&self) -> impl Iterator<Item = &ExperimentSpec> {
        self.specs.iter().filter(|s| s.duplicate_of.is_some())
    }
}
