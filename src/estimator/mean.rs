//! Mean baseline: predicts the (optionally trailing-window) training mean.

use serde::{Deserialize, Serialize};

use super::{check_predict_width, check_training_shape, Estimator, EstimatorFactory, FittedModel, ParamSpec};
use crate::experiment::Hyperparameters;
use crate::storage::FeatureMatrix;
use crate::Result;

const KIND: &str = "mean";

const PARAMS: &[ParamSpec] = &[ParamSpec::int("window", 1, 100_000)];

/// Factory for the `mean` baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanFactory;

impl EstimatorFactory for MeanFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn build(&self, params: &Hyperparameters) -> Result<Box<dyn Estimator>> {
        let window = params.get("window").map(|_| params.usize_or("window", 1));
        Ok(Box::new(MeanEstimator { window }))
    }

    fn restore(&self, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(serde_json::from_value::<MeanModel>(snapshot)?))
    }
}

#[derive(Debug)]
struct MeanEstimator {
    window: Option<usize>,
}

impl Estimator for MeanEstimator {
    #[allow(clippy::cast_precision_loss)]
    fn fit(&self, x: &FeatureMatrix, y: &[f64]) -> Result<Box<dyn FittedModel>> {
        check_training_shape(x, y)?;
        // Rows arrive in date order, so the tail is the most recent history.
        let tail = match self.window {
            Some(w) if w < y.len() => &y[y.len() - w..],
            _ => y,
        };
        let value = tail.iter().sum::<f64>() / tail.len() as f64;
        Ok(Box::new(MeanModel {
            value,
            n_features: x.n_cols(),
        }))
    }
}

/// Fitted `mean` baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanModel {
    value: f64,
    n_features: usize,
}

impl MeanModel {
    /// The constant prediction.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }
}

impl FittedModel for MeanModel {
    fn kind(&self) -> &str {
        KIND
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        check_predict_width(x, self.n_features)?;
        Ok(vec![self.value; x.n_rows()])
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
