//! Model selection over the run history
//!
//! **Problem**: pick the best run for a scope under several ranked metrics,
//! identically every time the same history is queried.
//!
//! **Solution**: a total order over eligible runs:
//! 1. criteria in priority order (each minimised or maximised)
//! 2. earliest `completed_at`
//! 3. smallest `run_id` (unique, so no two runs ever compare equal)
//!
//! Bounded leaderboards keep a max-heap of the `k` best seen so far, so the
//! history is streamed rather than sorted in full.
//!
//! Toyota Way Principles:
//! - **Jidoka**: empty criteria are rejected instead of silently picking
//!   an arbitrary run
//! - **Poka-Yoke**: "no eligible run" is an explicit value, never a
//!   missing row

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::repository::{RunFilter, RunRecord, RunRepository, RunStatus};
use crate::{Error, Result};

/// Optimisation direction of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smaller is better (errors)
    Minimize,
    /// Larger is better (R2)
    Maximize,
}

impl Direction {
    /// `Less` when `a` ranks ahead of `b`.
    #[must_use]
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        match self {
            Self::Minimize => a.total_cmp(&b),
            Self::Maximize => b.total_cmp(&a),
        }
    }
}

/// One ranking metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCriterion {
    /// Namespaced metric, e.g. `val.rmse`
    pub metric_name: String,
    /// Optimisation direction
    pub direction: Direction,
    /// Lower values are applied first
    #[serde(default)]
    pub priority: u32,
}

impl MetricCriterion {
    /// Create a criterion.
    #[must_use]
    pub fn new(metric_name: impl Into<String>, direction: Direction, priority: u32) -> Self {
        Self {
            metric_name: metric_name.into(),
            direction,
            priority,
        }
    }

    /// Minimise `metric_name` at priority 0.
    #[must_use]
    pub fn minimize(metric_name: impl Into<String>) -> Self {
        Self::new(metric_name, Direction::Minimize, 0)
    }

    /// Maximise `metric_name` at priority 0.
    #[must_use]
    pub fn maximize(metric_name: impl Into<String>) -> Self {
        Self::new(metric_name, Direction::Maximize, 0)
    }

    /// Parse a comma-separated list (`min:val.rmse,max:val.r2`); priority
    /// follows list position.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a malformed entry.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(i, entry)| {
                let mut criterion: Self = entry.parse()?;
                criterion.priority = u32::try_from(i).unwrap_or(u32::MAX);
                Ok(criterion)
            })
            .collect()
    }
}

impl FromStr for MetricCriterion {
    type Err = Error;

    /// `min:<metric>`, `max:<metric>`, or a bare metric name (R2 metrics
    /// maximise, everything else minimises).
    fn from_str(s: &str) -> Result<Self> {
        let (direction, metric) = match s.split_once(':') {
            Some(("min", metric)) => (Direction::Minimize, metric),
            Some(("max", metric)) => (Direction::Maximize, metric),
            Some((prefix, _)) => {
                return Err(Error::InvalidInput(format!(
                    "criterion '{s}': unknown direction '{prefix}' (expected min or max)"
                )))
            }
            None if s == "r2" || s.ends_with(".r2") => (Direction::Maximize, s),
            None => (Direction::Minimize, s),
        };
        if metric.trim().is_empty() {
            return Err(Error::InvalidInput(format!("criterion '{s}': empty metric name")));
        }
        Ok(Self::new(metric.trim(), direction, 0))
    }
}

impl fmt::Display for MetricCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.direction {
            Direction::Minimize => "min",
            Direction::Maximize => "max",
        };
        write!(f, "{prefix}:{}", self.metric_name)
    }
}

/// Which runs are candidates for selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionScope {
    /// Sweep label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_name: Option<String>,
    /// Store context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_context: Option<String>,
    /// Single experiment spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
}

impl SelectionScope {
    /// Scope over one sweep.
    #[must_use]
    pub fn execution(name: impl Into<String>) -> Self {
        Self {
            execution_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Scope over one store context across sweeps.
    #[must_use]
    pub fn store_context(context: impl Into<String>) -> Self {
        Self {
            store_context: Some(context.into()),
            ..Self::default()
        }
    }

    /// Narrow to a store context.
    #[must_use]
    pub fn with_store_context(mut self, context: impl Into<String>) -> Self {
        self.store_context = Some(context.into());
        self
    }

    /// Narrow to one experiment spec.
    #[must_use]
    pub fn with_experiment(mut self, experiment_id: impl Into<String>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.execution_name.is_none() && self.store_context.is_none() {
            return Err(Error::InvalidInput(
                "selection scope needs an execution name and/or a store context".to_string(),
            ));
        }
        Ok(())
    }

    /// Repository filter for succeeded runs in scope.
    #[must_use]
    pub fn to_filter(&self) -> RunFilter {
        let mut filter = RunFilter::new().status(RunStatus::Succeeded);
        if let Some(name) = &self.execution_name {
            filter = filter.execution_name(name.clone());
        }
        if let Some(context) = &self.store_context {
            filter = filter.store_context(context.clone());
        }
        if let Some(id) = &self.experiment_id {
            filter = filter.experiment_id(id.clone());
        }
        filter
    }
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Selection {
    /// At least one eligible run.
    Selected {
        /// Top-ranked run
        best: RunRecord,
        /// Every eligible run, best first
        leaderboard: Vec<RunRecord>,
    },
    /// Nothing in scope succeeded with every criterion metric present.
    NoEligibleRun,
}

impl Selection {
    /// The selected run, if any.
    #[must_use]
    pub const fn best(&self) -> Option<&RunRecord> {
        match self {
            Self::Selected { best, .. } => Some(best),
            Self::NoEligibleRun => None,
        }
    }

    /// Ranked eligible runs (empty when none).
    #[must_use]
    pub fn leaderboard(&self) -> &[RunRecord] {
        match self {
            Self::Selected { leaderboard, .. } => leaderboard,
            Self::NoEligibleRun => &[],
        }
    }
}

/// Heap entry ordered by rank (`Less` = better).
struct Ranked<'c> {
    record: RunRecord,
    criteria: &'c [MetricCriterion],
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_runs(&self.record, &other.record, self.criteria)
    }
}

/// Rank order of two eligible runs under sorted `criteria`.
#[must_use]
pub fn compare_runs(a: &RunRecord, b: &RunRecord, criteria: &[MetricCriterion]) -> Ordering {
    for criterion in criteria {
        let va = a.metric(&criterion.metric_name).unwrap_or(f64::NAN);
        let vb = b.metric(&criterion.metric_name).unwrap_or(f64::NAN);
        match criterion.direction.compare(va, vb) {
            Ordering::Equal => {}
            decided => return decided,
        }
    }
    a.completed_at()
        .cmp(&b.completed_at())
        .then_with(|| a.run_id().cmp(b.run_id()))
}

/// Deterministic multi-criteria selector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelSelector;

impl ModelSelector {
    /// Create a selector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Best run plus the full ranked leaderboard for `scope`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty criteria or an unbounded scope; storage
    /// errors from the repository. No eligible run is `Ok(NoEligibleRun)`.
    pub fn select(
        &self,
        repository: &dyn RunRepository,
        scope: &SelectionScope,
        criteria: &[MetricCriterion],
    ) -> Result<Selection> {
        let leaderboard = self.leaderboard(repository, scope, criteria, None)?;
        let mut ranked = leaderboard.into_iter();
        Ok(match ranked.next() {
            Some(best) => {
                let mut leaderboard = Vec::with_capacity(ranked.len() + 1);
                leaderboard.push(best.clone());
                leaderboard.extend(ranked);
                Selection::Selected { best, leaderboard }
            }
            None => Selection::NoEligibleRun,
        })
    }

    /// Ranked eligible runs, best first, optionally truncated to `limit`.
    ///
    /// # Errors
    ///
    /// Same as [`select`](Self::select).
    pub fn leaderboard(
        &self,
        repository: &dyn RunRepository,
        scope: &SelectionScope,
        criteria: &[MetricCriterion],
        limit: Option<usize>,
    ) -> Result<Vec<RunRecord>> {
        scope.validate()?;
        let criteria = sorted_criteria(criteria)?;
        let filter = scope.to_filter();

        let mut heap: BinaryHeap<Ranked<'_>> = BinaryHeap::new();
        let mut eligible = 0_usize;
        for record in repository.scan()? {
            let record = record?;
            if !filter.matches(&record) || !is_eligible(&record, &criteria) {
                continue;
            }
            eligible += 1;
            heap.push(Ranked {
                record,
                criteria: &criteria,
            });
            if limit.is_some_and(|k| heap.len() > k) {
                // Max-heap: the top is the worst ranked entry.
                heap.pop();
            }
        }
        debug!(eligible, criteria = criteria.len(), "ranked runs for selection");

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|ranked| ranked.record)
            .collect())
    }

    /// Rank an in-memory set of runs (no scope filtering).
    ///
    /// # Errors
    ///
    /// `InvalidInput` for empty criteria.
    pub fn rank(&self, runs: Vec<RunRecord>, criteria: &[MetricCriterion]) -> Result<Vec<RunRecord>> {
        let criteria = sorted_criteria(criteria)?;
        let mut eligible: Vec<RunRecord> = runs
            .into_iter()
            .filter(|r| r.is_succeeded() && is_eligible(r, &criteria))
            .collect();
        eligible.sort_by(|a, b| compare_runs(a, b, &criteria));
        Ok(eligible)
    }
}

fn sorted_criteria(criteria: &[MetricCriterion]) -> Result<Vec<MetricCriterion>> {
    if criteria.is_empty() {
        return Err(Error::InvalidInput(
            "at least one metric criterion is required".to_string(),
        ));
    }
    if let Some(bad) = criteria.iter().find(|c| c.metric_name.trim().is_empty()) {
        return Err(Error::InvalidInput(format!(
            "criterion with empty metric name (priority {})",
            bad.priority
        )));
    }
    let mut sorted = criteria.to_vec();
    sorted.sort_by_key(|c| c.priority);
    Ok(sorted)
}

fn is_eligible(record: &RunRecord, criteria: &[MetricCriterion]) -> bool {
    criteria
        .iter()
        .all(|c| record.metric(&c.metric_name).is_some_and(f64::is_finite))
}
