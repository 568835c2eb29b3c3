//! Tests for error types

use trueno_sweep::Error;

#[test]
fn test_definition_error_names_experiment_and_key() {
    let error = Error::definition("gbm-depth", "grid.depth", "expected int, got string");
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid experiment definition"));
    assert!(error_str.contains("gbm-depth"));
    assert!(error_str.contains("grid.depth"));
}

#[test]
fn test_run_execution_error() {
    let error = Error::RunExecution {
        experiment_id: "ridge-002".to_string(),
        message: "singular system".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("ridge-002"));
    assert!(error_str.contains("singular system"));
}

#[test]
fn test_repository_write_error() {
    let error = Error::RepositoryWrite {
        run_id: "run-7".to_string(),
        attempts: 3,
        message: "disk full".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("after 3 attempt(s)"));
    assert!(error_str.contains("completed runs are preserved"));
}

#[test]
fn test_duplicate_run_id_error() {
    let error = Error::DuplicateRunId("run-1".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Run id already exists"));
    assert!(error_str.contains("immutable"));
}

#[test]
fn test_metric_error() {
    let error = Error::Metric {
        metric: "rmsle".to_string(),
        message: "negative values".to_string(),
    };
    assert_eq!(format!("{error}"), "Metric 'rmsle' undefined: negative values");
}

#[test]
fn test_transient_classification() {
    assert!(Error::StorageUnavailable("busy".into()).is_transient());
    assert!(!Error::StorageError("run log lock poisoned".into()).is_transient());
    assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr")).is_transient());
    assert!(!Error::DuplicateRunId("r".into()).is_transient());
    assert!(!Error::InvalidInput("x".into()).is_transient());
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    assert!(format!("{error}").contains("IO error"));
}

#[test]
fn test_json_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let error: Error = json_error.into();
    assert!(format!("{error}").contains("JSON error"));
}

#[test]
fn test_error_debug_format() {
    let error = Error::NotFound("run 'x'".to_string());
    assert!(format!("{error:?}").contains("NotFound"));
}
