//! Run Record - immutable outcome of one experiment spec

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ArtifactRecord;
use crate::experiment::{ExperimentSpec, Hyperparameters, ValidationPolicy};
use crate::metrics::MetricReport;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Fit, predict and persistence completed (metrics may be partial).
    Succeeded,
    /// Fit or predict failed; `error` holds the summary.
    Failed,
}

impl RunStatus {
    /// Lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Generate a fresh run identifier (UUID v4).
#[must_use]
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run Record represents a single executed experiment spec.
///
/// Written once at completion and never modified; a re-run produces a new
/// record with a new `run_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    run_id: String,
    execution_name: String,
    experiment_id: String,
    sequence: usize,
    store_context: String,
    estimator_kind: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    target: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metric_errors: BTreeMap<String, String>,
    #[serde(default)]
    hyperparameters: Hyperparameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    validation_policy: Option<ValidationPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    predictions_ref: Option<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_ref: Option<ArtifactRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RunRecord {
    /// Create a builder with the identifying fields.
    #[must_use]
    pub fn builder(
        run_id: impl Into<String>,
        execution_name: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> RunRecordBuilder {
        RunRecordBuilder::new(run_id, execution_name, experiment_id)
    }

    /// Get the run ID.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Get the sweep label.
    #[must_use]
    pub fn execution_name(&self) -> &str {
        &self.execution_name
    }

    /// Get the originating experiment spec ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Declaration order of the originating spec.
    #[must_use]
    pub const fn sequence(&self) -> usize {
        self.sequence
    }

    /// Get the store context.
    #[must_use]
    pub fn store_context(&self) -> &str {
        &self.store_context
    }

    /// Get the estimator kind.
    #[must_use]
    pub fn estimator_kind(&self) -> &str {
        &self.estimator_kind
    }

    /// Feature columns the model was trained on.
    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Target column.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Get the run status.
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Get the start timestamp.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get the completion timestamp.
    #[must_use]
    pub const fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    /// Metric values keyed `partition.metric`.
    #[must_use]
    pub const fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Single metric value.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Metrics that could not be computed, with reasons.
    #[must_use]
    pub const fn metric_errors(&self) -> &BTreeMap<String, String> {
        &self.metric_errors
    }

    /// Copy of the resolved hyperparameters.
    #[must_use]
    pub const fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }

    /// Validation policy the run was evaluated under.
    #[must_use]
    pub const fn validation_policy(&self) -> Option<&ValidationPolicy> {
        self.validation_policy.as_ref()
    }

    /// Stored prediction artifact, if any.
    #[must_use]
    pub const fn predictions_ref(&self) -> Option<&ArtifactRecord> {
        self.predictions_ref.as_ref()
    }

    /// Stored model snapshot, if any.
    #[must_use]
    pub const fn model_ref(&self) -> Option<&ArtifactRecord> {
        self.model_ref.as_ref()
    }

    /// Failure summary for failed runs.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// True for succeeded runs.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Builder for `RunRecord`.
#[derive(Debug)]
pub struct RunRecordBuilder {
    record: RunRecord,
}

impl RunRecordBuilder {
    /// Create a new builder with required fields. Status defaults to
    /// succeeded; both timestamps default to now.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        execution_name: impl Into<String>,
        experiment_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            record: RunRecord {
                run_id: run_id.into(),
                execution_name: execution_name.into(),
                experiment_id: experiment_id.into(),
                sequence: 0,
                store_context: String::new(),
                estimator_kind: String::new(),
                features: Vec::new(),
                target: String::new(),
                status: RunStatus::Succeeded,
                started_at: now,
                completed_at: now,
                metrics: BTreeMap::new(),
                metric_errors: BTreeMap::new(),
                hyperparameters: Hyperparameters::new(),
                validation_policy: None,
                predictions_ref: None,
                model_ref: None,
                error: None,
            },
        }
    }

    /// Builder pre-filled from the `ExperimentSpec` the run executes.
    #[must_use]
    pub fn from_spec(run_id: impl Into<String>, execution_name: impl Into<String>, spec: &ExperimentSpec) -> Self {
        Self::new(run_id, execution_name, spec.experiment_id.clone())
            .sequence(spec.sequence)
            .store_context(spec.store_context.clone())
            .estimator_kind(spec.estimator_kind.clone())
            .features(spec.features.clone())
            .target(spec.target.clone())
            .hyperparameters(spec.hyperparameters.clone())
            .validation_policy(spec.validation_policy.clone())
    }

    /// Set the declaration sequence.
    #[must_use]
    pub const fn sequence(mut self, sequence: usize) -> Self {
        self.record.sequence = sequence;
        self
    }

    /// Set the store context.
    #[must_use]
    pub fn store_context(mut self, store_context: impl Into<String>) -> Self {
        self.record.store_context = store_context.into();
        self
    }

    /// Set the estimator kind.
    #[must_use]
    pub fn estimator_kind(mut self, kind: impl Into<String>) -> Self {
        self.record.estimator_kind = kind.into();
        self
    }

    /// Set the feature columns.
    #[must_use]
    pub fn features(mut self, features: Vec<String>) -> Self {
        self.record.features = features;
        self
    }

    /// Set the target column.
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.record.target = target.into();
        self
    }

    /// Set the hyperparameters.
    #[must_use]
    pub fn hyperparameters(mut self, params: Hyperparameters) -> Self {
        self.record.hyperparameters = params;
        self
    }

    /// Set the validation policy.
    #[must_use]
    pub fn validation_policy(mut self, policy: ValidationPolicy) -> Self {
        self.record.validation_policy = Some(policy);
        self
    }

    /// Set the start timestamp.
    #[must_use]
    pub const fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.started_at = at;
        self
    }

    /// Set the completion timestamp.
    #[must_use]
    pub const fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.completed_at = at;
        self
    }

    /// Record one metric value.
    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.record.metrics.insert(name.into(), value);
        self
    }

    /// Merge a metric report (values and per-metric failures).
    #[must_use]
    pub fn metric_report(mut self, report: MetricReport) -> Self {
        self.record.metrics.extend(report.values);
        self.record.metric_errors.extend(report.errors);
        self
    }

    /// Attach the prediction artifact.
    #[must_use]
    pub fn predictions_ref(mut self, artifact: ArtifactRecord) -> Self {
        self.record.predictions_ref = Some(artifact);
        self
    }

    /// Attach the model snapshot artifact.
    #[must_use]
    pub fn model_ref(mut self, artifact: ArtifactRecord) -> Self {
        self.record.model_ref = Some(artifact);
        self
    }

    /// Mark the run failed with an error summary.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.record.status = RunStatus::Failed;
        self.record.error = Some(error.into());
        self
    }

    /// Build the `RunRecord`.
    #[must_use]
    pub fn build(self) -> RunRecord {
        self.record
    }
}
