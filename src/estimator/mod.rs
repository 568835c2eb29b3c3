//! Estimator adapters
//!
//! Models sit behind a capability interface rather than a shared base type:
//!
//! ```text
//! EstimatorFactory ──build(params)──> Estimator ──fit(X, y)──> FittedModel ──predict(X)──> ŷ
//!        └──────────────────restore(snapshot)─────────────────────┘
//! ```
//!
//! New model types are added by implementing [`EstimatorFactory`] and
//! registering it in an [`EstimatorRegistry`]. Every factory declares the
//! parameters it accepts so experiment definitions can be rejected before
//! anything runs.
//!
//! ## Example
//!
//! ```rust
//! use trueno_sweep::estimator::EstimatorRegistry;
//! use trueno_sweep::experiment::Hyperparameters;
//! use trueno_sweep::storage::FeatureMatrix;
//!
//! # fn main() -> trueno_sweep::Result<()> {
//! let registry = EstimatorRegistry::with_builtin();
//! let params = Hyperparameters::new().with("alpha", 0.0);
//! let estimator = registry.build("ridge", &params)?;
//!
//! let x = FeatureMatrix::from_rows(vec!["x".into()], &[vec![1.0], vec![2.0], vec![3.0]])?;
//! let model = estimator.fit(&x, &[2.0, 4.0, 6.0])?;
//! let y_hat = model.predict(&x)?;
//! assert!((y_hat[2] - 6.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

mod gradient_boosting;
mod mean;
mod ridge;
mod sgd;

pub use gradient_boosting::{GradientBoostingFactory, GradientBoostingModel};
pub use mean::{MeanFactory, MeanModel};
pub use ridge::{RidgeFactory, RidgeModel};
pub use sgd::{SgdFactory, SgdModel};

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

use crate::experiment::{Hyperparameters, ParamValue};
use crate::storage::FeatureMatrix;
use crate::{Error, Result};

/// An unfitted, configured model.
pub trait Estimator: Send + fmt::Debug {
    /// Fit on training features and target.
    ///
    /// # Errors
    ///
    /// Returns an error for shape mismatches or numerically degenerate input.
    fn fit(&self, x: &FeatureMatrix, y: &[f64]) -> Result<Box<dyn FittedModel>>;
}

/// A trained model.
pub trait FittedModel: Send + Sync + fmt::Debug {
    /// Estimator kind that produced this model.
    fn kind(&self) -> &str;

    /// Predict one value per row of `x`.
    ///
    /// # Errors
    ///
    /// Returns an error when `x` has a different column count than training.
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>>;

    /// Serializable state, restorable through [`EstimatorFactory::restore`].
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    fn snapshot(&self) -> Result<serde_json::Value>;
}

/// Constructor and parameter schema for one estimator kind.
pub trait EstimatorFactory: Send + Sync {
    /// Registry key, e.g. `"ridge"`.
    fn kind(&self) -> &str;

    /// Accepted hyperparameters.
    fn params(&self) -> &[ParamSpec];

    /// Build an estimator from already-validated parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter combination is unusable.
    fn build(&self, params: &Hyperparameters) -> Result<Box<dyn Estimator>>;

    /// Rebuild a fitted model from [`FittedModel::snapshot`] output.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot does not belong to this kind.
    fn restore(&self, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>>;
}

/// Value domain of a hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamKind {
    /// Integer within `[min, max]`
    Int {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// Number within `[min, max]` (integers accepted)
    Float {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// Boolean flag
    Bool,
    /// One of a fixed set of labels
    Choice(&'static [&'static str]),
}

/// Declared hyperparameter of an estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: &'static str,
    /// Value domain
    pub kind: ParamKind,
    /// Must be present in every spec
    pub required: bool,
}

impl ParamSpec {
    /// Optional integer parameter.
    #[must_use]
    pub const fn int(name: &'static str, min: i64, max: i64) -> Self {
        Self {
            name,
            kind: ParamKind::Int { min, max },
            required: false,
        }
    }

    /// Optional numeric parameter.
    #[must_use]
    pub const fn float(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            kind: ParamKind::Float { min, max },
            required: false,
        }
    }

    /// Optional boolean parameter.
    #[must_use]
    pub const fn flag(name: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Bool,
            required: false,
        }
    }

    /// Optional categorical parameter.
    #[must_use]
    pub const fn choice(name: &'static str, options: &'static [&'static str]) -> Self {
        Self {
            name,
            kind: ParamKind::Choice(options),
            required: false,
        }
    }

    /// Mark as required.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Check a value against the declared domain.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason on type or range mismatch.
    pub fn check(&self, value: &ParamValue) -> std::result::Result<(), String> {
        match (self.kind, value) {
            (ParamKind::Int { min, max }, ParamValue::Int(v)) => {
                if (min..=max).contains(v) {
                    Ok(())
                } else {
                    Err(format!("{v} outside [{min}, {max}]"))
                }
            }
            (ParamKind::Float { min, max }, v @ (ParamValue::Int(_) | ParamValue::Float(_))) => {
                let x = v.as_f64().unwrap_or(f64::NAN);
                if x.is_finite() && x >= min && x <= max {
                    Ok(())
                } else {
                    Err(format!("{x} outside [{min}, {max}]"))
                }
            }
            (ParamKind::Bool, ParamValue::Bool(_)) => Ok(()),
            (ParamKind::Choice(options), ParamValue::Str(s)) => {
                if options.contains(&s.as_str()) {
                    Ok(())
                } else {
                    Err(format!("'{s}' is not one of {options:?}"))
                }
            }
            (kind, v) => Err(format!(
                "expected {}, got {} ({v})",
                kind_name(kind),
                v.type_name()
            )),
        }
    }
}

const fn kind_name(kind: ParamKind) -> &'static str {
    match kind {
        ParamKind::Int { .. } => "int",
        ParamKind::Float { .. } => "float",
        ParamKind::Bool => "bool",
        ParamKind::Choice(_) => "string",
    }
}

/// Rejected hyperparameter, reported against a definition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamError {
    /// Offending parameter name
    pub key: String,
    /// Reason
    pub message: String,
}

/// Estimator kinds available to a sweep.
#[derive(Clone, Default)]
pub struct EstimatorRegistry {
    factories: FxHashMap<String, Arc<dyn EstimatorFactory>>,
}

impl fmt::Debug for EstimatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimatorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl EstimatorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `mean`, `ridge`, `sgd` and `gradient_boosting`.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MeanFactory));
        registry.register(Arc::new(RidgeFactory));
        registry.register(Arc::new(SgdFactory));
        registry.register(Arc::new(GradientBoostingFactory));
        registry
    }

    /// Register (or replace) a factory under its kind.
    pub fn register(&mut self, factory: Arc<dyn EstimatorFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    /// Whether `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Look up a factory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unregistered kinds.
    pub fn factory(&self, kind: &str) -> Result<&Arc<dyn EstimatorFactory>> {
        self.factories
            .get(kind)
            .ok_or_else(|| Error::NotFound(format!("estimator kind '{kind}'")))
    }

    /// Resolve `params` against the accepted parameter set of `kind`.
    ///
    /// Unknown keys, type mismatches, out-of-range values and missing
    /// required parameters are all rejected.
    ///
    /// # Errors
    ///
    /// Returns the first offending key.
    pub fn check_params(
        &self,
        kind: &str,
        params: &Hyperparameters,
    ) -> std::result::Result<(), ParamError> {
        let factory = self.factories.get(kind).ok_or_else(|| ParamError {
            key: "estimator".to_string(),
            message: format!("unknown estimator kind '{kind}' (known: {:?})", self.kinds()),
        })?;
        let specs = factory.params();

        for (name, value) in params.iter() {
            let spec = specs.iter().find(|s| s.name == name).ok_or_else(|| {
                let accepted: Vec<&str> = specs.iter().map(|s| s.name).collect();
                ParamError {
                    key: name.to_string(),
                    message: format!("not accepted by '{kind}' (accepted: {accepted:?})"),
                }
            })?;
            spec.check(value).map_err(|message| ParamError {
                key: name.to_string(),
                message,
            })?;
        }

        if let Some(missing) = specs
            .iter()
            .find(|s| s.required && params.get(s.name).is_none())
        {
            return Err(ParamError {
                key: missing.name.to_string(),
                message: format!("required by '{kind}'"),
            });
        }
        Ok(())
    }

    /// Validate parameters and build a fresh estimator instance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown kinds and `InvalidInput` for rejected
    /// parameters.
    pub fn build(&self, kind: &str, params: &Hyperparameters) -> Result<Box<dyn Estimator>> {
        let factory = self.factory(kind)?;
        self.check_params(kind, params)
            .map_err(|e| Error::InvalidInput(format!("{kind}.{}: {}", e.key, e.message)))?;
        factory.build(params)
    }

    /// Restore a fitted model from its snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown kinds or the factory's restore error.
    pub fn restore(&self, kind: &str, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>> {
        self.factory(kind)?.restore(snapshot)
    }
}

/// Shared training-input validation for the built-in estimators.
pub(crate) fn check_training_shape(x: &FeatureMatrix, y: &[f64]) -> Result<()> {
    if x.n_rows() == 0 {
        return Err(Error::Estimator("empty training set".to_string()));
    }
    if x.n_rows() != y.len() {
        return Err(Error::Estimator(format!(
            "feature rows ({}) != target rows ({})",
            x.n_rows(),
            y.len()
        )));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(Error::Estimator("target contains non-finite values".to_string()));
    }
    Ok(())
}

/// Shared prediction-input validation for the built-in estimators.
pub(crate) fn check_predict_width(x: &FeatureMatrix, expected: usize) -> Result<()> {
    if x.n_cols() != expected {
        return Err(Error::Estimator(format!(
            "model trained on {expected} feature(s), got {}",
            x.n_cols()
        )));
    }
    Ok(())
}
