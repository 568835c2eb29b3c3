//! Engine configuration
//!
//! Loaded from an optional JSON file, then overridden from the environment:
//!
//! | variable                | field       |
//! |-------------------------|-------------|
//! | `TRUENO_SWEEP_DATA`     | `data_path` |
//! | `TRUENO_SWEEP_STORE`    | `store_dir` |
//! | `TRUENO_SWEEP_WORKERS`  | `workers`   |
//! | `TRUENO_SWEEP_BIND`     | `bind_addr` |
//!
//! The resulting value is passed explicitly to the runner and query API;
//! there is no global configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::experiment::DEFAULT_TARGET;
use crate::metrics::MetricKind;
use crate::repository::RetryPolicy;
use crate::{Error, Result};

/// Environment variable overriding [`EngineConfig::data_path`].
pub const ENV_DATA: &str = "TRUENO_SWEEP_DATA";
/// Environment variable overriding [`EngineConfig::store_dir`].
pub const ENV_STORE: &str = "TRUENO_SWEEP_STORE";
/// Environment variable overriding [`EngineConfig::workers`].
pub const ENV_WORKERS: &str = "TRUENO_SWEEP_WORKERS";
/// Environment variable overriding [`EngineConfig::bind_addr`].
pub const ENV_BIND: &str = "TRUENO_SWEEP_BIND";

/// Runtime configuration of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Parquet file holding the sales table
    pub data_path: PathBuf,
    /// Directory for the run log and artifacts
    pub store_dir: PathBuf,
    /// Worker threads; `1` runs specs sequentially
    pub workers: usize,
    /// Target column used when a definition names none
    pub target_column: String,
    /// Metrics computed on both partitions
    pub metrics: Vec<MetricKind>,
    /// Repository append retries
    pub retry: RetryPolicy,
    /// Query server listen address
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/sales.parquet"),
            store_dir: PathBuf::from("sweeps"),
            workers: 1,
            target_column: DEFAULT_TARGET.to_string(),
            metrics: MetricKind::ALL.to_vec(),
            retry: RetryPolicy::default(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Start from defaults.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load from a JSON file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// IO or JSON errors, or an invalid resulting configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (an environment-like accessor).
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unparseable values.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DATA) {
            self.data_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_STORE) {
            self.store_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_WORKERS) {
            self.workers = v
                .trim()
                .parse()
                .map_err(|_| Error::InvalidInput(format!("{ENV_WORKERS}='{v}' is not a count")))?;
        }
        if let Some(v) = lookup(ENV_BIND) {
            self.bind_addr = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unparseable values.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Check field invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidInput("workers must be >= 1".to_string()));
        }
        if self.metrics.is_empty() {
            return Err(Error::InvalidInput("metrics must not be empty".to_string()));
        }
        if self.target_column.trim().is_empty() {
            return Err(Error::InvalidInput("target_column must not be empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput("retry.max_attempts must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Set the sales table path.
    #[must_use]
    pub fn data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_path = path.into();
        self
    }

    /// Set the store directory.
    #[must_use]
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.store_dir = dir.into();
        self
    }

    /// Set the worker count.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Set the default target column.
    #[must_use]
    pub fn target_column(mut self, column: impl Into<String>) -> Self {
        self.config.target_column = column.into();
        self
    }

    /// Set the metric set.
    #[must_use]
    pub fn metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.config.metrics = metrics;
        self
    }

    /// Set the append retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the query server address.
    #[must_use]
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the offending field.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metrics.len(), 5);
        assert_eq!(config.target_column, "sales");
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = [(ENV_WORKERS, "4"), (ENV_STORE, "/tmp/runs")].into();
        let config = EngineConfig::default()
            .apply_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.store_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_bad_worker_override_rejected() {
        let result = EngineConfig::default()
            .apply_overrides(|k| (k == ENV_WORKERS).then(|| "many".to_string()));
        assert!(result.is_err());
        let zero = EngineConfig::default()
            .apply_overrides(|k| (k == ENV_WORKERS).then(|| "0".to_string()));
        assert!(zero.is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"workers": 2, "metrics": ["rmse", "mae"]}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.metrics, vec![MetricKind::Rmse, MetricKind::Mae]);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"wokers": 2}"#).unwrap();
        assert!(EngineConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .workers(8)
            .metrics(vec![MetricKind::Rmse])
            .build()
            .unwrap();
        assert_eq!(config.workers, 8);
        assert!(EngineConfig::builder().workers(0).build().is_err());
    }
}
