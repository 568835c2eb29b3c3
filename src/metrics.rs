//! Regression metric set
//!
//! Metrics are namespaced by partition when recorded on a run:
//! `train.rmse`, `val.mape`, ...
//!
//! A metric that is undefined for a partition (constant target for R2,
//! negative values for RMSLE, zero actuals for MAPE) is reported as an
//! error for that metric only; the other metrics of the run are kept.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Supported regression metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Mean absolute error
    Mae,
    /// Root mean squared error
    Rmse,
    /// Coefficient of determination
    R2,
    /// Root mean squared logarithmic error
    Rmsle,
    /// Mean absolute percentage error (fraction, not percent)
    Mape,
}

impl MetricKind {
    /// Every metric, in reporting order.
    pub const ALL: [Self; 5] = [Self::Mae, Self::Rmse, Self::R2, Self::Rmsle, Self::Mape];

    /// Lowercase metric name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mae => "mae",
            Self::Rmse => "rmse",
            Self::R2 => "r2",
            Self::Rmsle => "rmsle",
            Self::Mape => "mape",
        }
    }

    /// Compute the metric.
    ///
    /// # Errors
    ///
    /// Returns `Error::Metric` for empty or length-mismatched input, or when
    /// the metric is undefined for the data.
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(self, actual: &[f64], predicted: &[f64]) -> Result<f64> {
        let fail = |message: String| Error::Metric {
            metric: self.name().to_string(),
            message,
        };
        if actual.is_empty() {
            return Err(fail("empty partition".to_string()));
        }
        if actual.len() != predicted.len() {
            return Err(fail(format!(
                "{} actual value(s) vs {} prediction(s)",
                actual.len(),
                predicted.len()
            )));
        }
        let n = actual.len() as f64;
        let pairs = actual.iter().zip(predicted);

        let value = match self {
            Self::Mae => pairs.map(|(a, p)| (a - p).abs()).sum::<f64>() / n,
            Self::Rmse => (pairs.map(|(a, p)| (a - p).powi(2)).sum::<f64>() / n).sqrt(),
            Self::R2 => {
                let mean = actual.iter().sum::<f64>() / n;
                let ss_tot: f64 = actual.iter().map(|a| (a - mean).powi(2)).sum();
                if ss_tot == 0.0 {
                    return Err(fail("constant target".to_string()));
                }
                let ss_res: f64 = pairs.map(|(a, p)| (a - p).powi(2)).sum();
                1.0 - ss_res / ss_tot
            }
            Self::Rmsle => {
                if actual.iter().chain(predicted).any(|v| *v < 0.0) {
                    return Err(fail("negative values".to_string()));
                }
                (pairs
                    .map(|(a, p)| (a.ln_1p() - p.ln_1p()).powi(2))
                    .sum::<f64>()
                    / n)
                    .sqrt()
            }
            Self::Mape => {
                if actual.iter().any(|a| *a == 0.0) {
                    return Err(fail("zero actual value".to_string()));
                }
                pairs.map(|(a, p)| ((a - p) / a).abs()).sum::<f64>() / n
            }
        };

        if value.is_finite() {
            Ok(value)
        } else {
            Err(fail(format!("non-finite result ({value})")))
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown metric '{s}'")))
    }
}

/// Metric values and per-metric failures for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricReport {
    /// `partition.metric` -> value
    pub values: BTreeMap<String, f64>,
    /// `partition.metric` -> reason it is missing
    pub errors: BTreeMap<String, String>,
}

impl MetricReport {
    /// Empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `kinds` on one partition, namespacing keys with `prefix`.
    pub fn evaluate(&mut self, prefix: &str, kinds: &[MetricKind], actual: &[f64], predicted: &[f64]) {
        for kind in kinds {
            let key = format!("{prefix}.{}", kind.name());
            match kind.compute(actual, predicted) {
                Ok(value) => {
                    self.values.insert(key, value);
                }
                Err(Error::Metric { message, .. }) => {
                    self.errors.insert(key, message);
                }
                Err(other) => {
                    self.errors.insert(key, other.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTUAL: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
    const PREDICTED: [f64; 4] = [1.5, 2.0, 2.0, 4.0];

    #[test]
    fn test_mae_rmse() {
        let mae = MetricKind::Mae.compute(&ACTUAL, &PREDICTED).unwrap();
        let rmse = MetricKind::Rmse.compute(&ACTUAL, &PREDICTED).unwrap();
        assert!((mae - 0.375).abs() < 1e-12);
        assert!((rmse - (1.25_f64 / 4.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_r2_perfect_and_constant() {
        assert!((MetricKind::R2.compute(&ACTUAL, &ACTUAL).unwrap() - 1.0).abs() < 1e-12);
        assert!(MetricKind::R2.compute(&[2.0, 2.0], &[1.0, 3.0]).is_err());
    }

    #[test]
    fn test_rmsle_rejects_negative() {
        assert!(MetricKind::Rmsle.compute(&[1.0, 2.0], &[-0.5, 2.0]).is_err());
        assert_eq!(MetricKind::Rmsle.compute(&ACTUAL, &ACTUAL).unwrap(), 0.0);
    }

    #[test]
    fn test_mape_rejects_zero_actual() {
        assert!(MetricKind::Mape.compute(&[0.0, 2.0], &[1.0, 2.0]).is_err());
        let mape = MetricKind::Mape.compute(&[2.0, 4.0], &[1.0, 4.0]).unwrap();
        assert!((mape - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_empty_and_mismatched_input() {
        for kind in MetricKind::ALL {
            assert!(kind.compute(&[], &[]).is_err());
            assert!(kind.compute(&[1.0], &[1.0, 2.0]).is_err());
        }
    }

    #[test]
    fn test_report_keeps_partial_metrics() {
        let mut report = MetricReport::new();
        report.evaluate("val", &MetricKind::ALL, &[0.0, 5.0], &[1.0, 4.0]);
        assert!(report.values.contains_key("val.rmse"));
        assert!(report.values.contains_key("val.r2"));
        assert_eq!(report.errors.keys().collect::<Vec<_>>(), vec!["val.mape"]);
    }

    #[test]
    fn test_parse_metric_name() {
        assert_eq!("RMSE".parse::<MetricKind>().unwrap(), MetricKind::Rmse);
        assert!("auc".parse::<MetricKind>().is_err());
    }
}
