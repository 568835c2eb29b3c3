//! Experiment definitions
//!
//! ## Overview
//!
//! ```text
//! definition document ──DefinitionExpander──> ExperimentSet
//!                                                └── ExperimentSpec (N, declaration order)
//!                                                      ├── Hyperparameters
//!                                                      └── ValidationPolicy
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_sweep::estimator::EstimatorRegistry;
//! use trueno_sweep::experiment::DefinitionExpander;
//!
//! let registry = EstimatorRegistry::with_builtin();
//! let definition = r#"{
//!   "experiments": [{
//!     "kind": "variable_set",
//!     "name": "gbm",
//!     "estimator": "gradient_boosting",
//!     "store_context": "A",
//!     "features": ["onpromotion"],
//!     "grid": {"depth": [2, 4], "rate": [0.1]},
//!     "validation": {"type": "cutoff", "cutoff": "2017-06-30", "horizon_days": 15}
//!   }]
//! }"#;
//!
//! let set = DefinitionExpander::new(&registry)
//!     .expand_str("june-sweep", definition, "inline")
//!     .unwrap();
//! assert_eq!(set.len(), 2);
//! ```

mod expander;
mod params;
mod spec;
mod validation;

pub use expander::{DefinitionExpander, MAX_GRID_SIZE};
pub use params::{Hyperparameters, ParamValue};
pub use spec::{ExperimentSet, ExperimentSpec, DEFAULT_TARGET};
pub use validation::{DateRange, ValidationPolicy};
