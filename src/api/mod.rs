//! Experiment Query API
//!
//! Read-only boundary over the run history: list sweeps and runs, fetch a
//! run with its predictions, rank runs, and turn a selection into a
//! [`ModelHandle`] for inference. Nothing here appends or mutates.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use trueno_sweep::api::ExperimentQueryApi;
//! use trueno_sweep::repository::{RunRecord, RunRepository};
//! use trueno_sweep::runner::EngineContext;
//! use trueno_sweep::selector::{MetricCriterion, SelectionScope};
//! use trueno_sweep::storage::TabularStore;
//!
//! # fn main() -> trueno_sweep::Result<()> {
//! let context = EngineContext::in_memory(Arc::new(TabularStore::default()));
//! context.repository.append(
//!     RunRecord::builder("run-1", "june-sweep", "gbm-001").metric("val.rmse", 0.8).build(),
//! )?;
//!
//! let api = ExperimentQueryApi::new(context);
//! assert_eq!(api.list_executions()?, vec!["june-sweep"]);
//!
//! let selection = api.select(
//!     &SelectionScope::execution("june-sweep"),
//!     &[MetricCriterion::minimize("val.rmse")],
//! )?;
//! assert_eq!(selection.best().map(|r| r.run_id()), Some("run-1"));
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "server")]
pub mod http;

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::estimator::FittedModel;
use crate::experiment::DateRange;
use crate::repository::{Predictions, RunFilter, RunRecord};
use crate::runner::EngineContext;
use crate::selector::{MetricCriterion, ModelSelector, Selection, SelectionScope};
use crate::storage::{FeatureMatrix, Frame, PartitionProvider};
use crate::{Error, Result};

/// A run together with its stored predictions.
#[derive(Debug, Clone, Serialize)]
pub struct RunWithPredictions {
    /// The run record
    pub run: RunRecord,
    /// Predictions; absent for failed runs
    pub predictions: Option<Predictions>,
}

/// Fitted model of a selected run, ready for inference.
pub struct ModelHandle {
    run: RunRecord,
    features: Vec<String>,
    model: Box<dyn FittedModel>,
    partitions: Arc<dyn PartitionProvider>,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("run_id", &self.run.run_id())
            .field("features", &self.features)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    /// Run the model was taken from.
    #[must_use]
    pub const fn run(&self) -> &RunRecord {
        &self.run
    }

    /// Feature columns expected, in training order.
    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// Predict on prepared feature rows.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the columns differ from the training features.
    pub fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        if x.columns() != self.features.as_slice() {
            return Err(Error::InvalidInput(format!(
                "model expects features {:?}, got {:?}",
                self.features,
                x.columns()
            )));
        }
        self.model.predict(x)
    }

    /// Predict on a data slice, deriving the feature columns from it.
    ///
    /// # Errors
    ///
    /// Fails if a feature cannot be read from `frame`.
    pub fn predict_frame(&self, frame: &Frame) -> Result<Vec<f64>> {
        self.model.predict(&frame.features(&self.features)?)
    }

    /// Predict every row of the run's store context within `range`.
    ///
    /// # Errors
    ///
    /// Fails if the slice cannot be built or is empty.
    pub fn predict_range(&self, range: DateRange) -> Result<Vec<(NaiveDate, f64)>> {
        let frame = self.partitions.inference(self.run.store_context(), range)?;
        if frame.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no rows for '{}' in {} ..= {}",
                self.run.store_context(),
                range.start,
                range.end
            )));
        }
        let predicted = self.predict_frame(&frame)?;
        Ok(frame.dates()?.into_iter().zip(predicted).collect())
    }
}

/// Read-only query facade over an [`EngineContext`].
#[derive(Debug, Clone)]
pub struct ExperimentQueryApi {
    context: EngineContext,
    selector: ModelSelector,
}

impl ExperimentQueryApi {
    /// Create the API over `context`.
    #[must_use]
    pub const fn new(context: EngineContext) -> Self {
        Self {
            context,
            selector: ModelSelector::new(),
        }
    }

    /// Distinct execution names, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    pub fn list_executions(&self) -> Result<Vec<String>> {
        self.context.repository.execution_names()
    }

    /// Runs of one sweep, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    pub fn list_runs(&self, execution_name: &str) -> Result<Vec<RunRecord>> {
        let mut runs = self
            .context
            .repository
            .query(&RunFilter::new().execution_name(execution_name))?;
        runs.sort_by(|a, b| {
            a.sequence()
                .cmp(&b.sequence())
                .then_with(|| a.completed_at().cmp(&b.completed_at()))
        });
        Ok(runs)
    }

    /// Runs matching an arbitrary filter, in append order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    pub fn query(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        self.context.repository.query(filter)
    }

    /// One run by id.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.context
            .repository
            .get(run_id)?
            .ok_or_else(|| Error::NotFound(format!("run '{run_id}'")))
    }

    /// One run plus its predictions.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids or a missing prediction artifact.
    pub fn get_run_with_predictions(&self, run_id: &str) -> Result<RunWithPredictions> {
        let run = self.get_run(run_id)?;
        let predictions = run
            .predictions_ref()
            .map(|artifact| self.context.artifacts.load_predictions(artifact))
            .transpose()?;
        Ok(RunWithPredictions { run, predictions })
    }

    /// Best run and leaderboard for `scope` under `criteria`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty criteria or scope.
    pub fn select(&self, scope: &SelectionScope, criteria: &[MetricCriterion]) -> Result<Selection> {
        self.selector
            .select(self.context.repository.as_ref(), scope, criteria)
    }

    /// Top `limit` runs for `scope` under `criteria`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty criteria or scope.
    pub fn leaderboard(
        &self,
        scope: &SelectionScope,
        criteria: &[MetricCriterion],
        limit: usize,
    ) -> Result<Vec<RunRecord>> {
        self.selector
            .leaderboard(self.context.repository.as_ref(), scope, criteria, Some(limit))
    }

    /// Load the fitted model of the best run; `None` when nothing is
    /// eligible.
    ///
    /// # Errors
    ///
    /// Selection errors, or a missing or unrestorable model snapshot.
    pub fn resolve_model(
        &self,
        scope: &SelectionScope,
        criteria: &[MetricCriterion],
    ) -> Result<Option<ModelHandle>> {
        match self.select(scope, criteria)? {
            Selection::Selected { best, .. } => self.model_for(best).map(Some),
            Selection::NoEligibleRun => Ok(None),
        }
    }

    /// Load the fitted model of a specific run.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs or runs without a model snapshot.
    pub fn load_model(&self, run_id: &str) -> Result<ModelHandle> {
        self.model_for(self.get_run(run_id)?)
    }

    fn model_for(&self, run: RunRecord) -> Result<ModelHandle> {
        let artifact = run
            .model_ref()
            .ok_or_else(|| Error::NotFound(format!("model snapshot of run '{}'", run.run_id())))?;
        let snapshot = self.context.artifacts.load_model(artifact)?;
        let model = self
            .context
            .estimators
            .restore(&snapshot.estimator_kind, snapshot.state)?;
        Ok(ModelHandle {
            run,
            features: snapshot.features,
            model,
            partitions: Arc::clone(&self.context.partitions),
        })
    }
}
