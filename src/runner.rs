//! Sweep execution
//!
//! ```text
//! ExperimentSet ──> SweepRunner ──(per spec)──> partitions ─> fit ─> predict ─> metrics
//!                        │                                                        │
//!                        │                          ArtifactStore <── predictions + model
//!                        └──────────── append_with_retry ──> RunRepository <── RunRecord
//! ```
//!
//! Each spec runs in isolation: a fresh estimator instance, read-only
//! partition views, and its own `run_id`. A fit or predict failure (or a
//! panic inside an estimator) becomes a `failed` record and the sweep
//! continues. Only a repository write that exhausts its retries aborts the
//! sweep.
//!
//! With `workers > 1` specs run on a dedicated rayon pool. Records are
//! appended in completion order; the returned [`SweepReport`] is sorted by
//! declaration `sequence` either way.

use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, info_span, warn, Span};

use crate::config::EngineConfig;
use crate::estimator::EstimatorRegistry;
use crate::experiment::{ExperimentSet, ExperimentSpec};
use crate::metrics::{MetricKind, MetricReport};
use crate::repository::{
    append_with_retry, new_run_id, ArtifactRecord, ArtifactStore, FsArtifactStore,
    JsonlRunRepository, MemoryArtifactStore, MemoryRunRepository, ModelSnapshot, Partition,
    Predictions, RetryPolicy, RunRecord, RunRecordBuilder, RunRepository, RunStatus,
};
use crate::storage::{PartitionProvider, TabularStore};
use crate::{Error, Result};

/// Artifact directory inside the store directory.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Shared handles threaded through the runner and the query API.
#[derive(Clone)]
pub struct EngineContext {
    /// Run history
    pub repository: Arc<dyn RunRepository>,
    /// Prediction and model storage
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Read-only data slices
    pub partitions: Arc<dyn PartitionProvider>,
    /// Available estimator kinds
    pub estimators: Arc<EstimatorRegistry>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("estimators", &self.estimators)
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Assemble a context from explicit parts.
    #[must_use]
    pub fn new(
        repository: Arc<dyn RunRepository>,
        artifacts: Arc<dyn ArtifactStore>,
        partitions: Arc<dyn PartitionProvider>,
        estimators: Arc<EstimatorRegistry>,
    ) -> Self {
        Self {
            repository,
            artifacts,
            partitions,
            estimators,
        }
    }

    /// Ephemeral context: in-memory repository and artifacts, built-in
    /// estimators.
    #[must_use]
    pub fn in_memory(partitions: Arc<dyn PartitionProvider>) -> Self {
        Self::new(
            Arc::new(MemoryRunRepository::new()),
            Arc::new(MemoryArtifactStore::new()),
            partitions,
            Arc::new(EstimatorRegistry::with_builtin()),
        )
    }

    /// Durable context from configuration: Parquet sales table, JSON-lines
    /// run log and filesystem artifacts under `store_dir`.
    ///
    /// # Errors
    ///
    /// Fails if the data file or the store directory cannot be opened.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let table = TabularStore::load_parquet(&config.data_path)?;
        Ok(Self::new(
            Arc::new(JsonlRunRepository::open(&config.store_dir)?),
            Arc::new(FsArtifactStore::open(config.store_dir.join(ARTIFACTS_DIR))?),
            Arc::new(table),
            Arc::new(EstimatorRegistry::with_builtin()),
        ))
    }

    /// Read-only context over an existing store (no data file needed).
    ///
    /// # Errors
    ///
    /// Fails if the store directory cannot be opened.
    pub fn open_store(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(JsonlRunRepository::open(&config.store_dir)?),
            Arc::new(FsArtifactStore::open(config.store_dir.join(ARTIFACTS_DIR))?),
            Arc::new(TabularStore::default()),
            Arc::new(EstimatorRegistry::with_builtin()),
        ))
    }
}

/// Cooperative cancellation flag shared between a sweep and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Fresh, not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; specs already executing run to completion.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Execution knobs for a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Worker threads; `1` runs sequentially
    pub workers: usize,
    /// Metrics computed on both partitions
    pub metrics: Vec<MetricKind>,
    /// Repository append retries
    pub retry: RetryPolicy,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            metrics: MetricKind::ALL.to_vec(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&EngineConfig> for RunnerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            metrics: config.metrics.clone(),
            retry: config.retry,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Sweep label
    pub execution_name: String,
    /// Persisted records, sorted by declaration sequence
    pub runs: Vec<RunRecord>,
    /// Specs never started because of cancellation
    pub skipped: usize,
    /// Whether cancellation was observed
    pub cancelled: bool,
}

impl SweepReport {
    /// Number of succeeded runs.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.is_succeeded()).count()
    }

    /// Number of failed runs.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.runs.len() - self.succeeded()
    }

    /// Statuses in declaration order.
    #[must_use]
    pub fn statuses(&self) -> Vec<RunStatus> {
        self.runs.iter().map(RunRecord::status).collect()
    }
}

/// Artifacts and metrics of a successful evaluation.
struct Evaluation {
    report: MetricReport,
    predictions: ArtifactRecord,
    model: ArtifactRecord,
}

/// Executes expanded experiment sets against an [`EngineContext`].
#[derive(Debug, Clone)]
pub struct SweepRunner {
    context: EngineContext,
    options: RunnerOptions,
    cancel: CancellationToken,
}

impl SweepRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(context: EngineContext, options: RunnerOptions) -> Self {
        Self {
            context,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Share an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Handle for cancelling this runner's sweeps.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Engine context in use.
    #[must_use]
    pub const fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Run every spec of `set` and persist one record per started spec.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for unusable options; `RepositoryWrite` when an append
    /// exhausts its retries (records already appended stay persisted).
    /// Individual run failures are never errors.
    pub fn run(&self, set: &ExperimentSet) -> Result<SweepReport> {
        if self.options.workers == 0 {
            return Err(Error::InvalidInput("workers must be >= 1".to_string()));
        }
        if self.options.metrics.is_empty() {
            return Err(Error::InvalidInput("metric set must not be empty".to_string()));
        }

        let execution_name = set.execution_name();
        let span = info_span!("sweep", execution_name, specs = set.len());
        let _enter = span.enter();
        info!(
            source = set.source_label(),
            workers = self.options.workers,
            "sweep started"
        );

        let mut runs = if self.options.workers <= 1 {
            self.run_sequential(execution_name, set.specs())?
        } else {
            self.run_parallel(execution_name, set.specs(), &span)?
        };
        runs.sort_by_key(RunRecord::sequence);

        let report = SweepReport {
            execution_name: execution_name.to_string(),
            skipped: set.len() - runs.len(),
            cancelled: self.cancel.is_cancelled(),
            runs,
        };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped,
            cancelled = report.cancelled,
            "sweep finished"
        );
        Ok(report)
    }

    fn run_sequential(&self, execution_name: &str, specs: &[ExperimentSpec]) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::with_capacity(specs.len());
        for spec in specs {
            if self.cancel.is_cancelled() {
                break;
            }
            runs.push(self.run_and_persist(execution_name, spec, &Span::current())?);
        }
        Ok(runs)
    }

    fn run_parallel(
        &self,
        execution_name: &str,
        specs: &[ExperimentSpec],
        parent: &Span,
    ) -> Result<Vec<RunRecord>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|i| format!("trueno-sweep-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("Thread pool error: {e}")))?;

        let runs: Vec<Option<RunRecord>> = pool.install(|| {
            specs
                .par_iter()
                .map(|spec| {
                    if self.cancel.is_cancelled() {
                        return Ok(None);
                    }
                    self.run_and_persist(execution_name, spec, parent).map(Some)
                })
                .collect::<Result<_>>()
        })?;
        Ok(runs.into_iter().flatten().collect())
    }

    fn run_and_persist(&self, execution_name: &str, spec: &ExperimentSpec, parent: &Span) -> Result<RunRecord> {
        let record = self.execute(execution_name, spec, parent);
        if let Err(e) = append_with_retry(self.context.repository.as_ref(), &record, &self.options.retry) {
            self.discard_artifacts(record.run_id());
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            info!(experiment_id = %spec.experiment_id, "cancellation observed after append");
        }
        Ok(record)
    }

    /// Remove artifacts that no stored record references.
    fn discard_artifacts(&self, run_id: &str) {
        if let Err(e) = self.context.artifacts.remove_run(run_id) {
            warn!(%run_id, error = %e, "failed to remove orphaned artifacts");
        }
    }

    /// Execute one spec; never fails, failures are captured in the record.
    fn execute(&self, execution_name: &str, spec: &ExperimentSpec, parent: &Span) -> RunRecord {
        let run_id = new_run_id();
        let span = info_span!(parent: parent, "run", experiment_id = %spec.experiment_id, %run_id);
        let _enter = span.enter();

        let started_at = Utc::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(&run_id, spec)));
        let builder = RunRecordBuilder::from_spec(run_id.clone(), execution_name, spec).started_at(started_at);

        let builder = match outcome {
            Ok(Ok(evaluation)) => {
                if !evaluation.report.errors.is_empty() {
                    warn!(
                        undefined = ?evaluation.report.errors.keys().collect::<Vec<_>>(),
                        "some metrics could not be computed"
                    );
                }
                info!(
                    estimator = %spec.estimator_kind,
                    val_rmse = evaluation.report.values.get("val.rmse").copied(),
                    "run succeeded"
                );
                builder
                    .metric_report(evaluation.report)
                    .predictions_ref(evaluation.predictions)
                    .model_ref(evaluation.model)
            }
            Ok(Err(e)) => {
                self.discard_artifacts(&run_id);
                let error = Error::RunExecution {
                    experiment_id: spec.experiment_id.clone(),
                    message: e.to_string(),
                };
                warn!(error = %error, "run failed");
                builder.failed(e.to_string())
            }
            Err(payload) => {
                self.discard_artifacts(&run_id);
                let message = format!("estimator panicked: {}", panic_message(payload.as_ref()));
                warn!(error = %message, "run failed");
                builder.failed(message)
            }
        };
        builder.completed_at(Utc::now()).build()
    }

    fn evaluate(&self, run_id: &str, spec: &ExperimentSpec) -> Result<Evaluation> {
        let parts = self
            .context
            .partitions
            .partitions(&spec.store_context, &spec.validation_policy)?;
        let x_train = parts.train.features(&spec.features)?;
        let y_train = parts.train.target(&spec.target)?;
        let x_valid = parts.validation.features(&spec.features)?;
        let y_valid = parts.validation.target(&spec.target)?;

        let estimator = self
            .context
            .estimators
            .build(&spec.estimator_kind, &spec.hyperparameters)?;
        let model = estimator.fit(&x_train, &y_train)?;
        let train_pred = model.predict(&x_train)?;
        let valid_pred = model.predict(&x_valid)?;

        let mut report = MetricReport::new();
        report.evaluate("train", &self.options.metrics, &y_train, &train_pred);
        report.evaluate("val", &self.options.metrics, &y_valid, &valid_pred);

        let mut predictions = Predictions::new();
        predictions.extend_partition(Partition::Train, &parts.train.dates()?, &y_train, &train_pred)?;
        predictions.extend_partition(
            Partition::Validation,
            &parts.validation.dates()?,
            &y_valid,
            &valid_pred,
        )?;

        let snapshot = ModelSnapshot {
            estimator_kind: spec.estimator_kind.clone(),
            features: spec.features.clone(),
            state: model.snapshot()?,
        };
        Ok(Evaluation {
            report,
            predictions: self.context.artifacts.put_predictions(run_id, &predictions)?,
            model: self.context.artifacts.put_model(run_id, &snapshot)?,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
