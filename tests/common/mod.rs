//! Shared fixtures for integration tests.

#![allow(dead_code)]

use arrow::array::{Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, Duration, NaiveDate};
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use trueno_sweep::storage::{naive_to_date32, TabularStore};

/// First day of the synthetic table.
pub fn day0() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 1, 1).unwrap()
}

/// Synthetic daily sales for contexts `A` and `B` over 120 days.
///
/// `sales = base + 4 * onpromotion + day_of_week`, so linear models fit
/// the derived calendar feature exactly.
pub fn sales_batch() -> RecordBatch {
    let mut contexts = Vec::new();
    let mut dates = Vec::new();
    let mut sales = Vec::new();
    let mut promo = Vec::new();
    for (ctx, base) in [("A", 20.0), ("B", 50.0)] {
        for d in 0..120_i64 {
            let day = day0() + Duration::days(d);
            let on_promo = if d % 4 == 0 { 1.0 } else { 0.0 };
            let weekday = f64::from(day.weekday().num_days_from_monday());
            contexts.push(ctx);
            dates.push(naive_to_date32(day));
            promo.push(on_promo);
            sales.push(base + 4.0 * on_promo + weekday);
        }
    }
    let schema = Schema::new(vec![
        Field::new("store_context", DataType::Utf8, false),
        Field::new("date", DataType::Date32, false),
        Field::new("sales", DataType::Float64, false),
        Field::new("onpromotion", DataType::Float64, false),
    ]);
    RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(StringArray::from(contexts)),
            Arc::new(Date32Array::from(dates)),
            Arc::new(Float64Array::from(sales)),
            Arc::new(Float64Array::from(promo)),
        ],
    )
    .unwrap()
}

/// In-memory table over [`sales_batch`].
pub fn sales_table() -> TabularStore {
    TabularStore::new(vec![sales_batch()])
}

/// Write [`sales_batch`] to a Parquet file.
pub fn write_sales_parquet(path: &Path) {
    let batch = sales_batch();
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

/// Cutoff validation on day 89 with a 15-day horizon.
pub const CUTOFF_VALIDATION: &str =
    r#"{"type": "cutoff", "cutoff": "2017-03-30", "horizon_days": 15}"#;

/// One `validation_set` experiment per estimator kind, all on context `A`.
pub fn one_per_estimator(estimators: &[&str]) -> String {
    let experiments: Vec<String> = estimators
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            format!(
                r#"{{"kind": "validation_set", "name": "{kind}-{i}", "estimator": "{kind}",
                    "store_context": "A", "features": ["onpromotion", "day_of_week"],
                    "validations": [{CUTOFF_VALIDATION}]}}"#
            )
        })
        .collect();
    format!(r#"{{"experiments": [{}]}}"#, experiments.join(","))
}

/// Gradient boosting depth grid over both contexts.
pub const GBM_GRID: &str = r#"{
    "source_label": "gbm-grid",
    "experiments": [
        {"kind": "variable_set", "name": "gbm-a", "estimator": "gradient_boosting",
         "store_context": "A", "features": ["onpromotion", "day_of_week"],
         "grid": {"depth": [2, 4], "rate": [0.1], "rounds": [20]},
         "validation": {"type": "cutoff", "cutoff": "2017-03-30", "horizon_days": 15}},
        {"kind": "variable_set", "name": "gbm-b", "estimator": "gradient_boosting",
         "store_context": "B", "features": ["onpromotion", "day_of_week"],
         "grid": {"depth": [1, 3], "rate": [0.1], "rounds": [20]},
         "validation": {"type": "cutoff", "cutoff": "2017-03-30", "horizon_days": 15}}
    ]
}"#;
