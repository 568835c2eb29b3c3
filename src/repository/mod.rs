//! Run Repository
//!
//! ## Schema Overview
//!
//! ```text
//! execution_name (1) ──< RunRecord (N)      keyed by run_id
//!                           │                indexed by (execution_name, experiment_id)
//!                           │                and by each metric value
//!                           ├── predictions_ref ──> ArtifactStore (Parquet)
//!                           └── model_ref       ──> ArtifactStore (JSON)
//! ```
//!
//! Append is the only mutation. Reads stream over the stored history
//! ([`RunRepository::scan`]); "latest N" and "best by metric" keep bounded
//! state instead of materialising every record. Filters with a metric bound
//! are answered from the per-metric index without a scan.
//!
//! ## Usage
//!
//! ```rust
//! use trueno_sweep::repository::{MemoryRunRepository, RunFilter, RunRecord, RunRepository};
//!
//! let repo = MemoryRunRepository::new();
//! let run = RunRecord::builder("run-001", "june-sweep", "gbm-001")
//!     .metric("val.rmse", 0.9)
//!     .build();
//! repo.append(run).unwrap();
//!
//! let filter = RunFilter::new().execution_name("june-sweep").metric_max("val.rmse", 1.0);
//! assert_eq!(repo.query(&filter).unwrap().len(), 1);
//! ```

mod artifact_record;
mod artifacts;
mod jsonl;
mod memory;
mod run_record;

pub use artifact_record::{ArtifactKind, ArtifactRecord};
pub use artifacts::{
    ArtifactStore, FsArtifactStore, MemoryArtifactStore, ModelSnapshot, Partition, PredictionRow,
    Predictions,
};
pub use jsonl::JsonlRunRepository;
pub use memory::MemoryRunRepository;
pub use run_record::{new_run_id, RunRecord, RunRecordBuilder, RunStatus};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;
use tracing::warn;

use crate::selector::Direction;
use crate::{Error, Result};

/// Streamed run records.
pub type RunIter<'a> = Box<dyn Iterator<Item = Result<RunRecord>> + Send + 'a>;

/// Composable run filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    execution_name: Option<String>,
    experiment_id: Option<String>,
    store_context: Option<String>,
    status: Option<RunStatus>,
    metric_bounds: Vec<(String, Option<f64>, Option<f64>)>,
}

impl RunFilter {
    /// Filter matching every run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one sweep.
    #[must_use]
    pub fn execution_name(mut self, name: impl Into<String>) -> Self {
        self.execution_name = Some(name.into());
        self
    }

    /// Restrict to one experiment spec.
    #[must_use]
    pub fn experiment_id(mut self, id: impl Into<String>) -> Self {
        self.experiment_id = Some(id.into());
        self
    }

    /// Restrict to one store context.
    #[must_use]
    pub fn store_context(mut self, context: impl Into<String>) -> Self {
        self.store_context = Some(context.into());
        self
    }

    /// Restrict to one status.
    #[must_use]
    pub const fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Require `metric >= min` (runs without the metric are excluded).
    #[must_use]
    pub fn metric_min(mut self, metric: impl Into<String>, min: f64) -> Self {
        self.metric_bounds.push((metric.into(), Some(min), None));
        self
    }

    /// Require `metric <= max` (runs without the metric are excluded).
    #[must_use]
    pub fn metric_max(mut self, metric: impl Into<String>, max: f64) -> Self {
        self.metric_bounds.push((metric.into(), None, Some(max)));
        self
    }

    /// Sweep restriction, if any.
    #[must_use]
    pub fn execution_name_ref(&self) -> Option<&str> {
        self.execution_name.as_deref()
    }

    /// Experiment restriction, if any.
    #[must_use]
    pub fn experiment_id_ref(&self) -> Option<&str> {
        self.experiment_id.as_deref()
    }

    /// Whether `record` passes every set restriction.
    #[must_use]
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.execution_name
            .as_deref()
            .map_or(true, |n| n == record.execution_name())
            && self
                .experiment_id
                .as_deref()
                .map_or(true, |e| e == record.experiment_id())
            && self
                .store_context
                .as_deref()
                .map_or(true, |c| c == record.store_context())
            && self.status.map_or(true, |s| s == record.status())
            && self.metric_bounds.iter().all(|(name, min, max)| {
                record.metric(name).is_some_and(|v| {
                    min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
                })
            })
    }
}

impl RunFilter {
    /// First metric bound as `(metric, min, max)`, if any.
    fn first_metric_bound(&self) -> Option<(&str, Option<f64>, Option<f64>)> {
        self.metric_bounds
            .first()
            .map(|(name, min, max)| (name.as_str(), *min, *max))
    }
}

/// Sorted `(value, slot)` entries per metric name for range lookups.
///
/// Slots are positions in a backend's append-ordered storage. NaN values
/// are never indexed; no bound admits them.
#[derive(Debug, Default)]
struct MetricIndex {
    by_metric: FxHashMap<String, Vec<(f64, usize)>>,
}

impl MetricIndex {
    fn insert(&mut self, record: &RunRecord, slot: usize) {
        for (name, &value) in record.metrics() {
            if value.is_nan() {
                continue;
            }
            let entries = self.by_metric.entry(name.clone()).or_default();
            let at = entries.partition_point(|&(v, s)| v.total_cmp(&value).then(s.cmp(&slot)).is_lt());
            entries.insert(at, (value, slot));
        }
    }

    /// Slots with `min <= metric <= max`, in append order.
    fn range(&self, metric: &str, min: Option<f64>, max: Option<f64>) -> Vec<usize> {
        let Some(entries) = self.by_metric.get(metric) else {
            return Vec::new();
        };
        let lo = min.map_or(0, |m| entries.partition_point(|&(v, _)| v < m));
        let hi = max.map_or(entries.len(), |m| entries.partition_point(|&(v, _)| v <= m));
        let mut slots: Vec<usize> = entries[lo..hi.max(lo)].iter().map(|&(_, s)| s).collect();
        slots.sort_unstable();
        slots
    }

    /// Candidate slots for `filter`, or `None` when it has no metric bound.
    fn candidates(&self, filter: &RunFilter) -> Option<Vec<usize>> {
        filter
            .first_metric_bound()
            .map(|(metric, min, max)| self.range(metric, min, max))
    }
}

/// Recency key: completion time, then run id.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Recency(DateTime<Utc>, String);

/// Persistent store of run records.
pub trait RunRepository: Send + Sync {
    /// Persist `record` atomically and return its `run_id`.
    ///
    /// # Errors
    ///
    /// `DuplicateRunId` if the id is already stored (nothing is
    /// overwritten); storage errors otherwise.
    fn append(&self, record: RunRecord) -> Result<String>;

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Storage errors only; a miss is `Ok(None)`.
    fn get(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Stream every stored record in append order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be opened.
    fn scan(&self) -> Result<RunIter<'_>>;

    /// Distinct execution names, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn execution_names(&self) -> Result<Vec<String>>;

    /// Runs of one `(execution_name, experiment_id)` pair in append order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn runs_for_experiment(&self, execution_name: &str, experiment_id: &str) -> Result<Vec<RunRecord>> {
        self.query(
            &RunFilter::new()
                .execution_name(execution_name)
                .experiment_id(experiment_id),
        )
    }

    /// All records matching `filter`, in append order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn query(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut out = Vec::new();
        for record in self.scan()? {
            let record = record?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Number of records matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn count(&self, filter: &RunFilter) -> Result<usize> {
        let mut n = 0;
        for record in self.scan()? {
            if filter.matches(&record?) {
                n += 1;
            }
        }
        Ok(n)
    }

    /// The `n` most recently completed matching records, newest first.
    ///
    /// Keeps a min-heap of at most `n` entries while streaming.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn latest(&self, filter: &RunFilter, n: usize) -> Result<Vec<RunRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut heap: BinaryHeap<Reverse<(Recency, usize)>> = BinaryHeap::with_capacity(n + 1);
        let mut kept: Vec<Option<RunRecord>> = Vec::new();

        for record in self.scan()? {
            let record = record?;
            if !filter.matches(&record) {
                continue;
            }
            let key = Recency(record.completed_at(), record.run_id().to_string());
            if heap.len() < n {
                heap.push(Reverse((key, kept.len())));
                kept.push(Some(record));
            } else if let Some(Reverse((oldest, slot))) = heap.peek() {
                if key > *oldest {
                    let slot = *slot;
                    heap.pop();
                    kept[slot] = Some(record);
                    heap.push(Reverse((key, slot)));
                }
            }
        }

        let mut order: Vec<(Recency, usize)> = heap.into_iter().map(|Reverse(e)| e).collect();
        order.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(order
            .into_iter()
            .filter_map(|(_, slot)| kept[slot].take())
            .collect())
    }

    /// Best matching record by one metric; ties go to the earliest
    /// completion, then the smallest run id. Records without a finite value
    /// for `metric` are skipped.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the history cannot be read.
    fn best_by_metric(
        &self,
        filter: &RunFilter,
        metric: &str,
        direction: Direction,
    ) -> Result<Option<RunRecord>> {
        let mut best: Option<(f64, RunRecord)> = None;
        for record in self.scan()? {
            let record = record?;
            if !filter.matches(&record) {
                continue;
            }
            let Some(value) = record.metric(metric).filter(|v| v.is_finite()) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_value, current)) => match direction.compare(value, *best_value) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => {
                        (record.completed_at(), record.run_id())
                            < (current.completed_at(), current.run_id())
                    }
                },
            };
            if better {
                best = Some((value, record));
            }
        }
        Ok(best.map(|(_, record)| record))
    }
}

/// Bounded retry with exponential backoff for repository appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

/// Append with bounded retries on transient storage errors.
///
/// # Errors
///
/// `Error::RepositoryWrite` once retries are exhausted or the error is not
/// transient.
pub fn append_with_retry(
    repository: &dyn RunRepository,
    record: &RunRecord,
    policy: &RetryPolicy,
) -> Result<String> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match repository.append(record.clone()) {
            Ok(run_id) => return Ok(run_id),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    run_id = record.run_id(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "repository append failed, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                return Err(Error::RepositoryWrite {
                    run_id: record.run_id().to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn run(id: &str, exec: &str, rmse: f64, secs: i64) -> RunRecord {
        RunRecord::builder(id, exec, format!("exp-{id}"))
            .store_context("A")
            .metric("val.rmse", rmse)
            .completed_at(at(secs))
            .build()
    }

    #[test]
    fn test_filter_metric_bounds() {
        let record = run("r1", "s", 0.9, 0);
        assert!(RunFilter::new().metric_max("val.rmse", 1.0).matches(&record));
        assert!(!RunFilter::new().metric_min("val.rmse", 1.0).matches(&record));
        assert!(!RunFilter::new().metric_max("val.mae", 1.0).matches(&record));
        assert!(RunFilter::new()
            .execution_name("s")
            .store_context("A")
            .status(RunStatus::Succeeded)
            .matches(&record));
    }

    #[test]
    fn test_metric_index_range_is_inclusive() {
        let mut index = MetricIndex::default();
        for (slot, rmse) in [0.9, 0.5, f64::NAN, 1.2, 0.5, 0.7].iter().enumerate() {
            index.insert(&run(&format!("r{slot}"), "s", *rmse, 0), slot);
        }
        assert_eq!(index.range("val.rmse", Some(0.5), Some(0.9)), vec![0, 1, 4, 5]);
        assert_eq!(index.range("val.rmse", None, Some(0.5)), vec![1, 4]);
        assert_eq!(index.range("val.rmse", Some(1.0), None), vec![3]);
        assert_eq!(index.range("val.rmse", None, None), vec![0, 1, 3, 4, 5]);
        assert!(index.range("val.rmse", Some(2.0), Some(1.0)).is_empty());
        assert!(index.range("val.mae", None, None).is_empty());
        assert!(index.candidates(&RunFilter::new().execution_name("s")).is_none());
    }

    #[test]
    fn test_latest_keeps_newest_first() {
        let repo = MemoryRunRepository::new();
        for (i, secs) in [5, 1, 9, 3, 7].iter().enumerate() {
            repo.append(run(&format!("r{i}"), "s", 1.0, *secs)).unwrap();
        }
        let latest = repo.latest(&RunFilter::new(), 3).unwrap();
        let ids: Vec<&str> = latest.iter().map(RunRecord::run_id).collect();
        assert_eq!(ids, vec!["r2", "r4", "r0"]);
        assert!(repo.latest(&RunFilter::new(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_best_by_metric_tie_breaks_on_completion() {
        let repo = MemoryRunRepository::new();
        repo.append(run("t1", "s", 1.2, 1)).unwrap();
        repo.append(run("t3", "s", 0.9, 3)).unwrap();
        repo.append(run("t2", "s", 0.9, 2)).unwrap();
        let best = repo
            .best_by_metric(&RunFilter::new(), "val.rmse", Direction::Minimize)
            .unwrap()
            .unwrap();
        assert_eq!(best.run_id(), "t2");
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 10,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
    }

    /// Fails the first `failures` appends with a transient error.
    struct FlakyRepository {
        inner: MemoryRunRepository,
        failures: AtomicU32,
    }

    impl RunRepository for FlakyRepository {
        fn append(&self, record: RunRecord) -> Result<String> {
            if self.failures.load(AtomicOrdering::SeqCst) > 0 {
                self.failures.fetch_sub(1, AtomicOrdering::SeqCst);
                return Err(Error::StorageUnavailable("disk busy".into()));
            }
            self.inner.append(record)
        }
        fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
            self.inner.get(run_id)
        }
        fn scan(&self) -> Result<RunIter<'_>> {
            self.inner.scan()
        }
        fn execution_names(&self) -> Result<Vec<String>> {
            self.inner.execution_names()
        }
    }

    fn flaky(failures: u32) -> FlakyRepository {
        FlakyRepository {
            inner: MemoryRunRepository::new(),
            failures: AtomicU32::new(failures),
        }
    }

    #[test]
    fn test_retry_recovers_from_transient_errors() {
        let repo = flaky(2);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
        };
        let id = append_with_retry(&repo, &run("r1", "s", 1.0, 0), &policy).unwrap();
        assert_eq!(id, "r1");
        assert_eq!(repo.count(&RunFilter::new()).unwrap(), 1);
    }

    #[test]
    fn test_retry_gives_up_after_max_attempts() {
        let repo = flaky(5);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
        };
        let err = append_with_retry(&repo, &run("r1", "s", 1.0, 0), &policy).unwrap_err();
        assert!(matches!(err, Error::RepositoryWrite { attempts: 3, .. }));
    }

    /// Rejects every append with a deterministic storage error.
    struct PoisonedRepository {
        inner: MemoryRunRepository,
        attempts: AtomicU32,
    }

    impl RunRepository for PoisonedRepository {
        fn append(&self, _record: RunRecord) -> Result<String> {
            self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
            Err(Error::StorageError("run log lock poisoned".into()))
        }
        fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
            self.inner.get(run_id)
        }
        fn scan(&self) -> Result<RunIter<'_>> {
            self.inner.scan()
        }
        fn execution_names(&self) -> Result<Vec<String>> {
            self.inner.execution_names()
        }
    }

    #[test]
    fn test_deterministic_storage_error_is_not_retried() {
        let repo = PoisonedRepository {
            inner: MemoryRunRepository::new(),
            attempts: AtomicU32::new(0),
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff_ms: 1,
        };
        let err = append_with_retry(&repo, &run("r1", "s", 1.0, 0), &policy).unwrap_err();
        assert!(matches!(err, Error::RepositoryWrite { attempts: 1, .. }));
        assert_eq!(repo.attempts.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_duplicate_is_not_retried() {
        let repo = flaky(0);
        let policy = RetryPolicy::default();
        append_with_retry(&repo, &run("r1", "s", 1.0, 0), &policy).unwrap();
        let err = append_with_retry(&repo, &run("r1", "s", 2.0, 1), &policy).unwrap_err();
        assert!(matches!(err, Error::RepositoryWrite { attempts: 1, .. }));
    }
}
