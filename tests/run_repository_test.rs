//! Run history schema and repository contract tests.
//!
//! Every contract is exercised against both backends.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use trueno_sweep::experiment::{Hyperparameters, ValidationPolicy};
use trueno_sweep::repository::{
    ArtifactKind, ArtifactRecord, JsonlRunRepository, MemoryRunRepository, RunFilter, RunRecord,
    RunRepository, RunStatus,
};
use trueno_sweep::selector::{Direction, MetricCriterion, ModelSelector, SelectionScope};
use trueno_sweep::Error;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn run(id: &str, rmse: f64, secs: i64) -> RunRecord {
    RunRecord::builder(id, "june-sweep", format!("gbm-{id}"))
        .store_context("A")
        .metric("val.rmse", rmse)
        .completed_at(at(secs))
        .build()
}

fn backends() -> Vec<(&'static str, Arc<dyn RunRepository>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let memory: Arc<dyn RunRepository> = Arc::new(MemoryRunRepository::new());
    let jsonl: Arc<dyn RunRepository> = Arc::new(JsonlRunRepository::open(dir.path()).unwrap());
    vec![("memory", memory, None), ("jsonl", jsonl, Some(dir))]
}

// =============================================================================
// RunRecord Tests
// =============================================================================

#[test]
fn test_run_record_full_builder() {
    let policy = ValidationPolicy::Cutoff {
        cutoff: chrono::NaiveDate::from_ymd_opt(2017, 6, 30).unwrap(),
        horizon_days: 15,
        lookback_days: None,
    };
    let record = RunRecord::builder("run-1", "june-sweep", "gbm-001")
        .sequence(4)
        .store_context("B")
        .estimator_kind("gradient_boosting")
        .features(vec!["onpromotion".to_string()])
        .target("sales")
        .hyperparameters(Hyperparameters::new().with("depth", 4_i64))
        .validation_policy(policy.clone())
        .started_at(at(0))
        .completed_at(at(30))
        .metric("val.rmse", 0.7)
        .model_ref(ArtifactRecord::new("run-1", "runs/run-1/model.json", ArtifactKind::Model, 128))
        .build();

    assert_eq!(record.sequence(), 4);
    assert_eq!(record.store_context(), "B");
    assert_eq!(record.estimator_kind(), "gradient_boosting");
    assert_eq!(record.validation_policy(), Some(&policy));
    assert_eq!(record.completed_at() - record.started_at(), chrono::Duration::seconds(30));
    assert_eq!(record.model_ref().unwrap().size_bytes(), 128);
    assert!(record.predictions_ref().is_none());
}

#[test]
fn test_run_record_json_roundtrip_keeps_everything() {
    let record = RunRecord::builder("run-1", "june-sweep", "gbm-001")
        .hyperparameters(Hyperparameters::new().with("rate", 0.1).with("depth", 2_i64))
        .metric("val.rmse", 0.123_456_789)
        .failed("diverged")
        .build();
    let json = serde_json::to_string(&record).unwrap();
    let back: RunRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
}

// =============================================================================
// Repository Contract Tests
// =============================================================================

#[test]
fn test_append_never_overwrites() {
    for (name, repo, _guard) in backends() {
        repo.append(run("r1", 1.0, 0)).unwrap();
        let err = repo.append(run("r1", 0.1, 1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateRunId(_)), "{name}");
        assert_eq!(
            repo.get("r1").unwrap().unwrap().metric("val.rmse"),
            Some(1.0),
            "{name}"
        );
    }
}

#[test]
fn test_filters_compose() {
    for (name, repo, _guard) in backends() {
        repo.append(run("r1", 1.0, 0)).unwrap();
        repo.append(run("r2", 2.0, 1)).unwrap();
        repo.append(
            RunRecord::builder("r3", "june-sweep", "gbm-r3")
                .store_context("B")
                .failed("boom")
                .build(),
        )
        .unwrap();

        let filter = RunFilter::new()
            .execution_name("june-sweep")
            .store_context("A")
            .metric_max("val.rmse", 1.5);
        let hits = repo.query(&filter).unwrap();
        assert_eq!(hits.len(), 1, "{name}");
        assert_eq!(hits[0].run_id(), "r1", "{name}");
        assert_eq!(
            repo.count(&RunFilter::new().status(RunStatus::Failed)).unwrap(),
            1,
            "{name}"
        );
        assert_eq!(repo.runs_for_experiment("june-sweep", "gbm-r2").unwrap().len(), 1, "{name}");
    }
}

#[test]
fn test_latest_and_best_by_metric() {
    for (name, repo, _guard) in backends() {
        for (i, (rmse, secs)) in [(1.2, 1), (0.9, 2), (0.9, 3), (1.5, 4)].iter().enumerate() {
            repo.append(run(&format!("t{}", i + 1), *rmse, *secs)).unwrap();
        }
        let latest = repo.latest(&RunFilter::new(), 2).unwrap();
        let ids: Vec<&str> = latest.iter().map(RunRecord::run_id).collect();
        assert_eq!(ids, vec!["t4", "t3"], "{name}");

        let best = repo
            .best_by_metric(&RunFilter::new(), "val.rmse", Direction::Minimize)
            .unwrap()
            .unwrap();
        assert_eq!(best.run_id(), "t2", "{name}");
    }
}

#[test]
fn test_metric_range_query_matches_full_scan() {
    for (name, repo, _guard) in backends() {
        for (i, rmse) in [1.4, 0.6, 0.9, 0.6, 2.2, 1.0].iter().enumerate() {
            repo.append(run(&format!("m{i}"), *rmse, i as i64)).unwrap();
        }
        repo.append(
            RunRecord::builder("m-failed", "june-sweep", "gbm-x")
                .store_context("A")
                .metric("val.rmse", 0.8)
                .failed("late crash")
                .build(),
        )
        .unwrap();

        let filter = RunFilter::new()
            .metric_min("val.rmse", 0.6)
            .metric_max("val.rmse", 1.0)
            .status(RunStatus::Succeeded);
        let indexed: Vec<String> = repo
            .query(&filter)
            .unwrap()
            .iter()
            .map(|r| r.run_id().to_string())
            .collect();
        let scanned: Vec<String> = repo
            .scan()
            .unwrap()
            .map(Result::unwrap)
            .filter(|r| filter.matches(r))
            .map(|r| r.run_id().to_string())
            .collect();
        assert_eq!(indexed, vec!["m1", "m2", "m3", "m5"], "{name}");
        assert_eq!(indexed, scanned, "{name}");
        assert_eq!(repo.count(&filter).unwrap(), 4, "{name}");
    }
}

// =============================================================================
// Selection Scenarios
// =============================================================================

#[test]
fn test_tie_on_primary_metric_goes_to_earliest_completion() {
    for (name, repo, _guard) in backends() {
        repo.append(run("t1", 1.2, 1)).unwrap();
        repo.append(run("t3", 0.9, 3)).unwrap();
        repo.append(run("t2", 0.9, 2)).unwrap();

        let selection = ModelSelector::new()
            .select(
                repo.as_ref(),
                &SelectionScope::execution("june-sweep"),
                &[MetricCriterion::minimize("val.rmse")],
            )
            .unwrap();
        let ids: Vec<&str> = selection.leaderboard().iter().map(RunRecord::run_id).collect();
        assert_eq!(selection.best().unwrap().run_id(), "t2", "{name}");
        assert_eq!(ids, vec!["t2", "t3", "t1"], "{name}");
    }
}

#[test]
fn test_every_run_failed_means_no_eligible_run() {
    for (name, repo, _guard) in backends() {
        for id in ["f1", "f2"] {
            repo.append(
                RunRecord::builder(id, "june-sweep", "gbm-001")
                    .store_context("A")
                    .failed("fit failed")
                    .build(),
            )
            .unwrap();
        }
        let selection = ModelSelector::new()
            .select(
                repo.as_ref(),
                &SelectionScope::execution("june-sweep").with_store_context("A"),
                &[MetricCriterion::minimize("val.rmse")],
            )
            .unwrap();
        assert!(selection.best().is_none(), "{name}");
    }
}
