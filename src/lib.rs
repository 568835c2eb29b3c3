//! # Trueno-Sweep: Experiment Execution & Evaluation Engine
//!
//! **Version**: 0.1.0
//!
//! Trueno-Sweep expands declarative experiment definitions into concrete
//! specs, runs them against partitioned sales data, records every outcome in
//! an append-only run history, and selects the best model under ranked
//! metric criteria.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: a malformed definition stops the line before anything runs
//! - **Poka-Yoke**: run records are immutable; appends never overwrite
//! - **Heijunka**: a bounded worker pool with identical results at any width
//! - **Genchi Genbutsu**: every run keeps its predictions for inspection
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trueno_sweep::experiment::DefinitionExpander;
//! use trueno_sweep::runner::{EngineContext, RunnerOptions, SweepRunner};
//! use trueno_sweep::selector::{MetricCriterion, SelectionScope};
//! use trueno_sweep::storage::TabularStore;
//! use trueno_sweep::api::ExperimentQueryApi;
//!
//! let table = TabularStore::load_parquet("data/sales.parquet")?;
//! let context = EngineContext::in_memory(Arc::new(table));
//!
//! let set = DefinitionExpander::new(&context.estimators)
//!     .expand_file("june-sweep", "sweeps/june.json")?;
//! let report = SweepRunner::new(context.clone(), RunnerOptions::default()).run(&set)?;
//! println!("{} succeeded, {} failed", report.succeeded(), report.failed());
//!
//! let api = ExperimentQueryApi::new(context);
//! let selection = api.select(
//!     &SelectionScope::execution("june-sweep"),
//!     &[MetricCriterion::minimize("val.rmse")],
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod api;
pub mod config;
pub mod error;
pub mod estimator;
pub mod experiment;
pub mod metrics;
pub mod repository;
pub mod runner;
pub mod selector;
pub mod storage;

pub use error::{Error, Result};
