//! Linear regression trained by full-batch gradient descent.
//!
//! Inner products run on `trueno` SIMD vectors (AVX-512/AVX2/SSE2
//! auto-detect). Features are standardised before training, so the learning
//! rate is independent of feature scale. Training is deterministic: no
//! shuffling, no random initialisation.

use serde::{Deserialize, Serialize};
use trueno::Vector;

use super::{check_predict_width, check_training_shape, Estimator, EstimatorFactory, FittedModel, ParamSpec};
use crate::experiment::Hyperparameters;
use crate::storage::FeatureMatrix;
use crate::{Error, Result};

const KIND: &str = "sgd";

const PARAMS: &[ParamSpec] = &[
    ParamSpec::float("learning_rate", 1.0e-6, 1.0),
    ParamSpec::int("epochs", 1, 100_000),
    ParamSpec::float("l2", 0.0, 10.0),
];

/// Factory for `sgd`.
///
/// Parameters: `learning_rate` (default 0.1), `epochs` (default 500),
/// `l2` (default 0.0).
#[derive(Debug, Clone, Copy, Default)]
pub struct SgdFactory;

impl EstimatorFactory for SgdFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    #[allow(clippy::cast_possible_truncation)]
    fn build(&self, params: &Hyperparameters) -> Result<Box<dyn Estimator>> {
        Ok(Box::new(SgdEstimator {
            learning_rate: params.f64_or("learning_rate", 0.1) as f32,
            epochs: params.usize_or("epochs", 500),
            l2: params.f64_or("l2", 0.0) as f32,
        }))
    }

    fn restore(&self, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(serde_json::from_value::<SgdModel>(snapshot)?))
    }
}

#[derive(Debug)]
struct SgdEstimator {
    learning_rate: f32,
    epochs: usize,
    l2: f32,
}

fn simd_dot(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.is_empty() {
        return Ok(0.0);
    }
    Vector::from_slice(a)
        .dot(&Vector::from_slice(b))
        .map_err(|e| Error::Estimator(format!("SIMD dot product failed: {e:?}")))
}

impl Estimator for SgdEstimator {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn fit(&self, x: &FeatureMatrix, y: &[f64]) -> Result<Box<dyn FittedModel>> {
        check_training_shape(x, y)?;
        let n = x.n_rows();
        let p = x.n_cols();

        let mut means = vec![0.0_f64; p];
        let mut stds = vec![0.0_f64; p];
        for j in 0..p {
            let column = x.column(j);
            let mean = column.iter().sum::<f64>() / n as f64;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
            means[j] = mean;
            // Constant columns contribute nothing; keep them finite.
            stds[j] = if var > 0.0 { var.sqrt() } else { 1.0 };
        }

        // Column-major standardised features for the gradient pass
        let columns: Vec<Vec<f32>> = (0..p)
            .map(|j| {
                x.column(j)
                    .iter()
                    .map(|v| ((v - means[j]) / stds[j]) as f32)
                    .collect()
            })
            .collect();
        let rows: Vec<Vec<f32>> = (0..n)
            .map(|i| columns.iter().map(|c| c[i]).collect())
            .collect();
        let target: Vec<f32> = y.iter().map(|v| *v as f32).collect();

        let mut weights = vec![0.0_f32; p];
        let mut bias = (y.iter().sum::<f64>() / n as f64) as f32;
        let scale = 1.0 / n as f32;
        let mut residuals = vec![0.0_f32; n];

        for _ in 0..self.epochs {
            for (i, row) in rows.iter().enumerate() {
                residuals[i] = simd_dot(row, &weights)? + bias - target[i];
            }
            for (j, column) in columns.iter().enumerate() {
                let grad = simd_dot(column, &residuals)? * scale + self.l2 * weights[j];
                weights[j] -= self.learning_rate * grad;
            }
            bias -= self.learning_rate * residuals.iter().sum::<f32>() * scale;
        }

        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
            return Err(Error::Estimator(format!(
                "gradient descent diverged (learning_rate = {})",
                self.learning_rate
            )));
        }

        Ok(Box::new(SgdModel {
            means,
            stds,
            weights,
            bias,
        }))
    }
}

/// Fitted `sgd` model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdModel {
    means: Vec<f64>,
    stds: Vec<f64>,
    weights: Vec<f32>,
    bias: f32,
}

impl FittedModel for SgdModel {
    fn kind(&self) -> &str {
        KIND
    }

    #[allow(clippy::cast_possible_truncation)]
    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        check_predict_width(x, self.weights.len())?;
        let mut scaled = vec![0.0_f32; self.weights.len()];
        (0..x.n_rows())
            .map(|i| {
                for (j, v) in x.row(i).iter().enumerate() {
                    scaled[j] = ((v - self.means[j]) / self.stds[j]) as f32;
                }
                Ok(f64::from(simd_dot(&scaled, &self.weights)? + self.bias))
            })
            .collect()
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converges_on_linear_data() {
        let rows: Vec<Vec<f64>> = (0..50).map(|i| vec![f64::from(i), f64::from(i % 7)]).collect();
        let x = FeatureMatrix::from_rows(vec!["t".into(), "dow".into()], &rows).unwrap();
        let y: Vec<f64> = rows.iter().map(|r| 5.0 + 0.5 * r[0] + 2.0 * r[1]).collect();

        let params = Hyperparameters::new().with("epochs", 2000_i64);
        let model = SgdFactory.build(&params).unwrap().fit(&x, &y).unwrap();
        let y_hat = model.predict(&x).unwrap();
        for (a, b) in y.iter().zip(&y_hat) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_deterministic_fit() {
        let rows: Vec<Vec<f64>> = (0..20).map(|i| vec![f64::from(i)]).collect();
        let x = FeatureMatrix::from_rows(vec!["t".into()], &rows).unwrap();
        let y: Vec<f64> = (0..20).map(|i| f64::from(i) * 3.0).collect();

        let a = SgdFactory.build(&Hyperparameters::new()).unwrap().fit(&x, &y).unwrap();
        let b = SgdFactory.build(&Hyperparameters::new()).unwrap().fit(&x, &y).unwrap();
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }
}
