//! Ridge regression via the regularised normal equations.

use serde::{Deserialize, Serialize};

use super::{check_predict_width, check_training_shape, Estimator, EstimatorFactory, FittedModel, ParamSpec};
use crate::experiment::Hyperparameters;
use crate::storage::FeatureMatrix;
use crate::{Error, Result};

const KIND: &str = "ridge";

const PARAMS: &[ParamSpec] = &[
    ParamSpec::float("alpha", 0.0, 1.0e6),
    ParamSpec::flag("fit_intercept"),
];

/// Factory for `ridge`.
///
/// Parameters: `alpha` (L2 penalty, default 1.0), `fit_intercept`
/// (default true).
#[derive(Debug, Clone, Copy, Default)]
pub struct RidgeFactory;

impl EstimatorFactory for RidgeFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn build(&self, params: &Hyperparameters) -> Result<Box<dyn Estimator>> {
        Ok(Box::new(RidgeEstimator {
            alpha: params.f64_or("alpha", 1.0),
            fit_intercept: params.bool_or("fit_intercept", true),
        }))
    }

    fn restore(&self, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(serde_json::from_value::<RidgeModel>(snapshot)?))
    }
}

#[derive(Debug)]
struct RidgeEstimator {
    alpha: f64,
    fit_intercept: bool,
}

impl Estimator for RidgeEstimator {
    #[allow(clippy::cast_precision_loss, clippy::needless_range_loop)]
    fn fit(&self, x: &FeatureMatrix, y: &[f64]) -> Result<Box<dyn FittedModel>> {
        check_training_shape(x, y)?;
        let n = x.n_rows();
        let p = x.n_cols();

        let (x_mean, y_mean) = if self.fit_intercept {
            let mut means = vec![0.0; p];
            for i in 0..n {
                for (m, v) in means.iter_mut().zip(x.row(i)) {
                    *m += v;
                }
            }
            means.iter_mut().for_each(|m| *m /= n as f64);
            (means, y.iter().sum::<f64>() / n as f64)
        } else {
            (vec![0.0; p], 0.0)
        };

        // Gram matrix and moment vector on centred data
        let mut gram = vec![vec![0.0; p]; p];
        let mut moment = vec![0.0; p];
        for i in 0..n {
            let row = x.row(i);
            let yc = y[i] - y_mean;
            for a in 0..p {
                let xa = row[a] - x_mean[a];
                moment[a] += xa * yc;
                for b in a..p {
                    gram[a][b] += xa * (row[b] - x_mean[b]);
                }
            }
        }
        for a in 0..p {
            gram[a][a] += self.alpha;
            for b in 0..a {
                gram[a][b] = gram[b][a];
            }
        }

        let weights = solve(gram, moment).ok_or_else(|| {
            Error::Estimator(format!(
                "singular system (alpha = {}); features are collinear or constant",
                self.alpha
            ))
        })?;
        let intercept = y_mean
            - weights
                .iter()
                .zip(&x_mean)
                .map(|(w, m)| w * m)
                .sum::<f64>();

        Ok(Box::new(RidgeModel {
            features: x.columns().to_vec(),
            weights,
            intercept,
        }))
    }
}

/// Gaussian elimination with partial pivoting. `None` if singular.
#[allow(clippy::needless_range_loop)]
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut out = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * out[k]).sum();
        out[row] = (b[row] - tail) / a[row][row];
    }
    Some(out)
}

/// Fitted `ridge` model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeModel {
    features: Vec<String>,
    weights: Vec<f64>,
    intercept: f64,
}

impl RidgeModel {
    /// Coefficients in feature order.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Intercept term.
    #[must_use]
    pub const fn intercept(&self) -> f64 {
        self.intercept
    }
}

impl FittedModel for RidgeModel {
    fn kind(&self) -> &str {
        KIND
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        check_predict_width(x, self.weights.len())?;
        Ok((0..x.n_rows())
            .map(|i| {
                self.intercept
                    + x.row(i)
                        .iter()
                        .zip(&self.weights)
                        .map(|(v, w)| v * w)
                        .sum::<f64>()
            })
            .collect())
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
