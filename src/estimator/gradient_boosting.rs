//! Gradient boosted regression trees (squared loss).
//!
//! Parameters:
//! - `depth`: maximum tree depth (default 3)
//! - `rate`: shrinkage applied to every tree (default 0.1)
//! - `rounds`: number of trees (default 100)
//! - `min_leaf`: minimum rows per leaf (default 1)
//!
//! Splits are exhaustive over sorted feature values; ties keep the first
//! best split found, so training is deterministic.

use serde::{Deserialize, Serialize};

use super::{check_predict_width, check_training_shape, Estimator, EstimatorFactory, FittedModel, ParamSpec};
use crate::experiment::Hyperparameters;
use crate::storage::FeatureMatrix;
use crate::Result;

const KIND: &str = "gradient_boosting";

const PARAMS: &[ParamSpec] = &[
    ParamSpec::int("depth", 1, 16),
    ParamSpec::float("rate", 1.0e-4, 1.0),
    ParamSpec::int("rounds", 1, 5_000),
    ParamSpec::int("min_leaf", 1, 100_000),
];

/// Factory for `gradient_boosting`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientBoostingFactory;

impl EstimatorFactory for GradientBoostingFactory {
    fn kind(&self) -> &str {
        KIND
    }

    fn params(&self) -> &[ParamSpec] {
        PARAMS
    }

    fn build(&self, params: &Hyperparameters) -> Result<Box<dyn Estimator>> {
        Ok(Box::new(GradientBoostingEstimator {
            depth: params.usize_or("depth", 3),
            rate: params.f64_or("rate", 0.1),
            rounds: params.usize_or("rounds", 100),
            min_leaf: params.usize_or("min_leaf", 1),
        }))
    }

    fn restore(&self, snapshot: serde_json::Value) -> Result<Box<dyn FittedModel>> {
        Ok(Box::new(serde_json::from_value::<GradientBoostingModel>(
            snapshot,
        )?))
    }
}

#[derive(Debug)]
struct GradientBoostingEstimator {
    depth: usize,
    rate: f64,
    rounds: usize,
    min_leaf: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn predict_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[feature] <= threshold { left } else { right },
            }
        }
    }
}

struct TreeBuilder<'a> {
    x: &'a FeatureMatrix,
    residuals: &'a [f64],
    max_depth: usize,
    min_leaf: usize,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    #[allow(clippy::cast_precision_loss)]
    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let sum: f64 = indices.iter().map(|&i| self.residuals[i]).sum();
        let leaf_value = sum / indices.len() as f64;

        let split = if depth < self.max_depth && indices.len() >= 2 * self.min_leaf {
            self.best_split(&indices, sum)
        } else {
            None
        };

        let Some((feature, threshold)) = split else {
            self.nodes.push(Node::Leaf { value: leaf_value });
            return self.nodes.len() - 1;
        };

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.x.value(i, feature) <= threshold);

        // Reserve the slot so children land after their parent.
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf { value: leaf_value });
        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[slot] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    /// Variance-reduction split: maximise `S_L²/n_L + S_R²/n_R`.
    #[allow(clippy::cast_precision_loss)]
    fn best_split(&self, indices: &[usize], total: f64) -> Option<(usize, f64)> {
        let n = indices.len();
        let base = total * total / n as f64;
        let mut best: Option<(f64, usize, f64)> = None;
        let mut order = indices.to_vec();

        for feature in 0..self.x.n_cols() {
            order.sort_by(|&a, &b| {
                self.x
                    .value(a, feature)
                    .total_cmp(&self.x.value(b, feature))
                    .then(a.cmp(&b))
            });

            let mut left_sum = 0.0;
            for k in 0..n - 1 {
                left_sum += self.residuals[order[k]];
                let n_left = k + 1;
                let n_right = n - n_left;
                if n_left < self.min_leaf || n_right < self.min_leaf {
                    continue;
                }
                let here = self.x.value(order[k], feature);
                let next = self.x.value(order[k + 1], feature);
                if here == next {
                    continue;
                }
                let right_sum = total - left_sum;
                let gain = left_sum * left_sum / n_left as f64
                    + right_sum * right_sum / n_right as f64
                    - base;
                if gain > 1e-12 && best.map_or(true, |(g, _, _)| gain > g) {
                    best = Some((gain, feature, (here + next) / 2.0));
                }
            }
        }
        best.map(|(_, feature, threshold)| (feature, threshold))
    }
}

impl Estimator for GradientBoostingEstimator {
    #[allow(clippy::cast_precision_loss)]
    fn fit(&self, x: &FeatureMatrix, y: &[f64]) -> Result<Box<dyn FittedModel>> {
        check_training_shape(x, y)?;
        let n = x.n_rows();
        let initial = y.iter().sum::<f64>() / n as f64;
        let mut current = vec![initial; n];
        let mut residuals = vec![0.0; n];
        let mut trees = Vec::with_capacity(self.rounds);

        for _ in 0..self.rounds {
            for i in 0..n {
                residuals[i] = y[i] - current[i];
            }
            let mut builder = TreeBuilder {
                x,
                residuals: &residuals,
                max_depth: self.depth,
                min_leaf: self.min_leaf,
                nodes: Vec::new(),
            };
            builder.grow((0..n).collect(), 0);
            let tree = Tree {
                nodes: builder.nodes,
            };
            for (i, c) in current.iter_mut().enumerate() {
                *c += self.rate * tree.predict_row(x.row(i));
            }
            trees.push(tree);
        }

        Ok(Box::new(GradientBoostingModel {
            n_features: x.n_cols(),
            initial,
            rate: self.rate,
            trees,
        }))
    }
}

/// Fitted `gradient_boosting` model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostingModel {
    n_features: usize,
    initial: f64,
    rate: f64,
    trees: Vec<Tree>,
}

impl GradientBoostingModel {
    /// Number of boosting rounds actually fitted.
    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }
}

impl FittedModel for GradientBoostingModel {
    fn kind(&self) -> &str {
        KIND
    }

    fn predict(&self, x: &FeatureMatrix) -> Result<Vec<f64>> {
        check_predict_width(x, self.n_features)?;
        Ok((0..x.n_rows())
            .map(|i| {
                let row = x.row(i);
                self.initial
                    + self
                        .trees
                        .iter()
                        .map(|t| self.rate * t.predict_row(row))
                        .sum::<f64>()
            })
            .collect())
    }

    fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
