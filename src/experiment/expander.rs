//! Experiment Definition Expander
//!
//! Pure transform from a declarative definition document to an ordered
//! [`ExperimentSet`]. Nothing is executed here; every key is checked up
//! front and the first problem rejects the whole set.
//!
//! ## Document shape
//!
//! ```json
//! {
//!   "source_label": "sweeps/june.json",
//!   "experiments": [
//!     {
//!       "kind": "variable_set",
//!       "name": "gbm-depth",
//!       "estimator": "gradient_boosting",
//!       "store_context": "A",
//!       "features": ["onpromotion", "day_of_week"],
//!       "grid": { "depth": [2, 4], "rate": [0.1] },
//!       "validation": { "type": "cutoff", "cutoff": "2017-06-30", "horizon_days": 15 }
//!     },
//!     {
//!       "kind": "validation_set",
//!       "name": "ridge-windows",
//!       "estimator": "ridge",
//!       "store_context": "A",
//!       "features": ["onpromotion"],
//!       "hyperparameters": { "alpha": 1.0 },
//!       "validations": [
//!         { "type": "cutoff", "cutoff": "2017-05-31", "horizon_days": 15 },
//!         { "type": "cutoff", "cutoff": "2017-06-30", "horizon_days": 15 }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Grid expansion is a full Cartesian product in declaration order: the
//! first declared parameter varies slowest.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use super::{ExperimentSet, ExperimentSpec, Hyperparameters, ParamValue, ValidationPolicy, DEFAULT_TARGET};
use crate::estimator::EstimatorRegistry;
use crate::{Error, Result};

/// Upper bound on specs produced by a single grid.
pub const MAX_GRID_SIZE: usize = 10_000;

const ROOT: &str = "<root>";
const ROOT_KEYS: &[&str] = &["source_label", "experiments"];
const COMMON_KEYS: &[&str] = &[
    "kind",
    "name",
    "description",
    "estimator",
    "store_context",
    "target",
    "features",
];
const VARIABLE_SET_KEYS: &[&str] = &["grid", "validation"];
const VALIDATION_SET_KEYS: &[&str] = &["hyperparameters", "validations"];
const DATE_RANGE_KEYS: &[&str] = &["type", "train_start", "train_end", "valid_start", "valid_end"];
const CUTOFF_KEYS: &[&str] = &["type", "cutoff", "horizon_days", "lookback_days"];

/// Expands definition documents against an estimator registry.
#[derive(Debug, Clone, Copy)]
pub struct DefinitionExpander<'a> {
    registry: &'a EstimatorRegistry,
    default_target: &'a str,
}

impl<'a> DefinitionExpander<'a> {
    /// Expander validating hyperparameters against `registry`.
    #[must_use]
    pub const fn new(registry: &'a EstimatorRegistry) -> Self {
        Self {
            registry,
            default_target: DEFAULT_TARGET,
        }
    }

    /// Target column for experiments that do not name one.
    #[must_use]
    pub const fn with_default_target(mut self, target: &'a str) -> Self {
        self.default_target = target;
        self
    }

    /// Read and expand a definition file. The path is the source label
    /// unless the document declares one.
    ///
    /// # Errors
    ///
    /// IO and JSON errors, or any definition error.
    pub fn expand_file(&self, execution_name: &str, path: impl AsRef<Path>) -> Result<ExperimentSet> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        self.expand_str(execution_name, &text, &path.display().to_string())
    }

    /// Parse and expand a JSON definition.
    ///
    /// # Errors
    ///
    /// JSON syntax errors, or any definition error.
    pub fn expand_str(&self, execution_name: &str, text: &str, source_label: &str) -> Result<ExperimentSet> {
        let document: Value = serde_json::from_str(text)?;
        self.expand(execution_name, &document, source_label)
    }

    /// Expand a parsed definition document.
    ///
    /// # Errors
    ///
    /// `Error::Definition` naming the offending experiment and key.
    pub fn expand(&self, execution_name: &str, document: &Value, source_label: &str) -> Result<ExperimentSet> {
        if execution_name.trim().is_empty() {
            return Err(Error::definition(ROOT, "execution_name", "must not be empty"));
        }
        let root = document
            .as_object()
            .ok_or_else(|| Error::definition(ROOT, ROOT, "definition must be a JSON object"))?;
        check_keys(ROOT, root, ROOT_KEYS, "")?;

        let label = match root.get("source_label") {
            None => source_label.to_string(),
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::definition(ROOT, "source_label", "expected string"))?,
        };

        let experiments = root
            .get("experiments")
            .ok_or_else(|| Error::definition(ROOT, "experiments", "missing"))?
            .as_array()
            .ok_or_else(|| Error::definition(ROOT, "experiments", "expected array"))?;
        if experiments.is_empty() {
            return Err(Error::definition(ROOT, "experiments", "empty experiment list"));
        }

        let mut specs = Vec::new();
        let mut seen_names: FxHashMap<String, usize> = FxHashMap::default();
        let mut fingerprints: FxHashMap<String, String> = FxHashMap::default();

        for (index, entry) in experiments.iter().enumerate() {
            let label_for_errors = format!("experiments[{index}]");
            let object = entry
                .as_object()
                .ok_or_else(|| Error::definition(&label_for_errors, ROOT, "expected object"))?;
            let name = required_str(&label_for_errors, object, "name")?;
            if name.trim().is_empty() {
                return Err(Error::definition(&label_for_errors, "name", "must not be empty"));
            }
            if let Some(first) = seen_names.insert(name.to_string(), index) {
                return Err(Error::definition(
                    name,
                    "name",
                    format!("duplicate experiment name (first declared at experiments[{first}])"),
                ));
            }

            for mut spec in self.expand_experiment(name, object)? {
                spec.sequence = specs.len();
                let fingerprint = spec.fingerprint();
                if let Some(original) = fingerprints.get(&fingerprint) {
                    warn!(
                        experiment_id = %spec.experiment_id,
                        duplicate_of = %original,
                        "experiment spec repeats an earlier configuration"
                    );
                    spec.duplicate_of = Some(original.clone());
                } else {
                    fingerprints.insert(fingerprint, spec.experiment_id.clone());
                }
                specs.push(spec);
            }
        }

        debug!(execution_name, specs = specs.len(), "expanded experiment set");
        Ok(ExperimentSet::new(execution_name, label, specs))
    }

    fn expand_experiment(&self, name: &str, object: &Map<String, Value>) -> Result<Vec<ExperimentSpec>> {
        let kind = required_str(name, object, "kind")?;
        let extra = match kind {
            "variable_set" => VARIABLE_SET_KEYS,
            "validation_set" => VALIDATION_SET_KEYS,
            other => {
                return Err(Error::definition(
                    name,
                    "kind",
                    format!("unknown kind '{other}' (expected variable_set or validation_set)"),
                ))
            }
        };
        let allowed: Vec<&str> = COMMON_KEYS.iter().chain(extra).copied().collect();
        check_keys(name, object, &allowed, "")?;

        let estimator = required_str(name, object, "estimator")?;
        if !self.registry.contains(estimator) {
            return Err(Error::definition(
                name,
                "estimator",
                format!("unknown estimator kind '{estimator}' (known: {:?})", self.registry.kinds()),
            ));
        }
        let store_context = required_str(name, object, "store_context")?;
        let description = match object.get("description") {
            None => None,
            Some(v) => Some(
                v.as_str()
                    .ok_or_else(|| Error::definition(name, "description", "expected string"))?
                    .to_string(),
            ),
        };
        let target = match object.get("target") {
            None => self.default_target.to_string(),
            Some(_) => required_str(name, object, "target")?.to_string(),
        };
        let features = parse_features(name, object, &target)?;

        let variants: Vec<(Hyperparameters, ValidationPolicy)> = if kind == "variable_set" {
            let policy = parse_policy(name, "validation", required(name, object, "validation")?)?;
            self.expand_grid(name, estimator, required(name, object, "grid")?)?
                .into_iter()
                .map(|params| (params, policy.clone()))
                .collect()
        } else {
            let params = match object.get("hyperparameters") {
                None => Hyperparameters::new(),
                Some(v) => parse_fixed_params(name, v)?,
            };
            self.check_params(name, "hyperparameters", estimator, &params)?;
            let list = required(name, object, "validations")?
                .as_array()
                .ok_or_else(|| Error::definition(name, "validations", "expected array"))?;
            if list.is_empty() {
                return Err(Error::definition(name, "validations", "empty validation list"));
            }
            list.iter()
                .enumerate()
                .map(|(i, v)| {
                    parse_policy(name, &format!("validations[{i}]"), v).map(|p| (params.clone(), p))
                })
                .collect::<Result<_>>()?
        };

        Ok(variants
            .into_iter()
            .enumerate()
            .map(|(i, (hyperparameters, validation_policy))| ExperimentSpec {
                experiment_id: format!("{name}-{:03}", i + 1),
                experiment_name: name.to_string(),
                sequence: 0,
                description: description.clone(),
                store_context: store_context.to_string(),
                estimator_kind: estimator.to_string(),
                hyperparameters,
                validation_policy,
                features: features.clone(),
                target: target.clone(),
                duplicate_of: None,
            })
            .collect())
    }

    fn expand_grid(&self, name: &str, estimator: &str, grid: &Value) -> Result<Vec<Hyperparameters>> {
        let grid = grid
            .as_object()
            .ok_or_else(|| Error::definition(name, "grid", "expected object of value lists"))?;
        if grid.is_empty() {
            return Err(Error::definition(name, "grid", "empty grid"));
        }

        let mut axes: Vec<(&str, Vec<ParamValue>)> = Vec::with_capacity(grid.len());
        let mut size: usize = 1;
        for (key, values) in grid {
            let path = format!("grid.{key}");
            let values = values
                .as_array()
                .ok_or_else(|| Error::definition(name, &path, "expected array of values"))?;
            if values.is_empty() {
                return Err(Error::definition(name, &path, "empty value list"));
            }
            size = size
                .checked_mul(values.len())
                .filter(|s| *s <= MAX_GRID_SIZE)
                .ok_or_else(|| {
                    Error::definition(name, &path, format!("grid exceeds {MAX_GRID_SIZE} combinations"))
                })?;
            let parsed = values
                .iter()
                .map(|v| scalar(name, &path, v))
                .collect::<Result<Vec<_>>>()?;
            axes.push((key.as_str(), parsed));
        }

        let mut combos = vec![Hyperparameters::new()];
        for (key, values) in &axes {
            combos = combos
                .into_iter()
                .flat_map(|base| {
                    values
                        .iter()
                        .map(move |v| base.clone().with(*key, v.clone()))
                })
                .collect();
        }
        for params in &combos {
            self.check_params(name, "grid", estimator, params)?;
        }
        Ok(combos)
    }

    fn check_params(&self, name: &str, section: &str, estimator: &str, params: &Hyperparameters) -> Result<()> {
        self.registry
            .check_params(estimator, params)
            .map_err(|e| Error::definition(name, format!("{section}.{}", e.key), e.message))
    }
}

fn check_keys(experiment: &str, object: &Map<String, Value>, allowed: &[&str], prefix: &str) -> Result<()> {
    match object.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(unknown) => Err(Error::definition(
            experiment,
            format!("{prefix}{unknown}"),
            format!("unknown key (allowed: {allowed:?})"),
        )),
        None => Ok(()),
    }
}

fn required<'v>(experiment: &str, object: &'v Map<String, Value>, key: &str) -> Result<&'v Value> {
    object
        .get(key)
        .ok_or_else(|| Error::definition(experiment, key, "missing required key"))
}

fn required_str<'v>(experiment: &str, object: &'v Map<String, Value>, key: &str) -> Result<&'v str> {
    required(experiment, object, key)?
        .as_str()
        .ok_or_else(|| Error::definition(experiment, key, "expected string"))
}

fn scalar(experiment: &str, key: &str, value: &Value) -> Result<ParamValue> {
    match value {
        Value::Bool(b) => Ok(ParamValue::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(ParamValue::Int)
            .or_else(|| n.as_f64().map(ParamValue::Float))
            .ok_or_else(|| Error::definition(experiment, key, format!("unsupported number {n}"))),
        Value::String(s) => Ok(ParamValue::Str(s.clone())),
        other => Err(Error::definition(
            experiment,
            key,
            format!("expected scalar value, got {other}"),
        )),
    }
}

fn parse_fixed_params(experiment: &str, value: &Value) -> Result<Hyperparameters> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::definition(experiment, "hyperparameters", "expected object"))?;
    object
        .iter()
        .map(|(k, v)| -> Result<(String, ParamValue)> {
            Ok((k.clone(), scalar(experiment, &format!("hyperparameters.{k}"), v)?))
        })
        .collect()
}

fn parse_features(experiment: &str, object: &Map<String, Value>, target: &str) -> Result<Vec<String>> {
    let list = required(experiment, object, "features")?
        .as_array()
        .ok_or_else(|| Error::definition(experiment, "features", "expected array of column names"))?;
    if list.is_empty() {
        return Err(Error::definition(experiment, "features", "empty feature list"));
    }
    let mut features: Vec<String> = Vec::with_capacity(list.len());
    for (i, v) in list.iter().enumerate() {
        let column = v
            .as_str()
            .ok_or_else(|| Error::definition(experiment, format!("features[{i}]"), "expected string"))?;
        if column == target {
            return Err(Error::definition(
                experiment,
                format!("features[{i}]"),
                format!("target column '{target}' cannot be a feature"),
            ));
        }
        if features.iter().any(|f| f == column) {
            return Err(Error::definition(
                experiment,
                format!("features[{i}]"),
                format!("duplicate feature '{column}'"),
            ));
        }
        features.push(column.to_string());
    }
    Ok(features)
}

fn parse_policy(experiment: &str, key: &str, value: &Value) -> Result<ValidationPolicy> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::definition(experiment, key, "expected validation policy object"))?;
    let allowed = match object.get("type").and_then(Value::as_str) {
        Some("date_range") => DATE_RANGE_KEYS,
        Some("cutoff") => CUTOFF_KEYS,
        Some(other) => {
            return Err(Error::definition(
                experiment,
                format!("{key}.type"),
                format!("unknown policy '{other}' (expected date_range or cutoff)"),
            ))
        }
        None => return Err(Error::definition(experiment, format!("{key}.type"), "missing policy type")),
    };
    check_keys(experiment, object, allowed, &format!("{key}."))?;

    let policy: ValidationPolicy = serde_json::from_value(value.clone())
        .map_err(|e| Error::definition(experiment, key, e.to_string()))?;
    policy
        .resolve()
        .map_err(|e| Error::definition(experiment, key, e.to_string()))?;
    Ok(policy)
}
