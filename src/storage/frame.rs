//! Immutable tabular views handed to estimators.

use arrow::array::{Array, ArrayRef, Date32Array, Float64Array, StringArray};
use arrow::compute;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use chrono::{Datelike, NaiveDate};

use super::DATE_COLUMN;
use crate::{Error, Result};

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Calendar features derived from `date` when not stored as columns.
pub const CALENDAR_FEATURES: &[&str] = &["day_of_month", "day_of_week", "month_of_year"];

/// Convert an Arrow `Date32` value to a calendar date.
#[must_use]
pub fn date32_to_naive(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(EPOCH_DAYS_FROM_CE)?)
}

/// Convert a calendar date to an Arrow `Date32` value.
#[must_use]
pub fn naive_to_date32(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
}

/// Decode a date column (`Date32` or ISO-8601 `Utf8`). Nulls and
/// unparseable strings decode to `None`.
///
/// # Errors
///
/// Returns `StorageError` for any other column type.
pub fn decode_dates(array: &ArrayRef) -> Result<Vec<Option<NaiveDate>>> {
    match array.data_type() {
        DataType::Date32 => {
            let dates = array
                .as_any()
                .downcast_ref::<Date32Array>()
                .ok_or_else(|| Error::Other("Failed to downcast to Date32Array".to_string()))?;
            Ok((0..dates.len())
                .map(|i| {
                    if dates.is_null(i) {
                        None
                    } else {
                        date32_to_naive(dates.value(i))
                    }
                })
                .collect())
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let cast = compute::cast(array, &DataType::Utf8)?;
            let strings = cast
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::Other("Failed to downcast to StringArray".to_string()))?;
            Ok((0..strings.len())
                .map(|i| {
                    if strings.is_null(i) {
                        None
                    } else {
                        NaiveDate::parse_from_str(strings.value(i), "%Y-%m-%d").ok()
                    }
                })
                .collect())
        }
        other => Err(Error::StorageError(format!(
            "column '{DATE_COLUMN}' has unsupported type {other:?} (expected Date32 or Utf8)"
        ))),
    }
}

/// Dense row-major feature matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    values: Vec<f64>,
    n_rows: usize,
}

impl FeatureMatrix {
    /// Build from rows; every row must have one value per column.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` on ragged rows.
    pub fn from_rows(columns: Vec<String>, rows: &[Vec<f64>]) -> Result<Self> {
        let width = columns.len();
        let mut values = Vec::with_capacity(rows.len() * width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(Error::InvalidInput(format!(
                    "row {i} has {} value(s), expected {width}",
                    row.len()
                )));
            }
            values.extend_from_slice(row);
        }
        Ok(Self {
            columns,
            values,
            n_rows: rows.len(),
        })
    }

    /// Build from equally long columns.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when column lengths differ.
    pub fn from_columns(columns: Vec<String>, data: &[Vec<f64>]) -> Result<Self> {
        if columns.len() != data.len() {
            return Err(Error::InvalidInput(format!(
                "{} column name(s) for {} column(s)",
                columns.len(),
                data.len()
            )));
        }
        let n_rows = data.first().map_or(0, Vec::len);
        if let Some(bad) = data.iter().position(|c| c.len() != n_rows) {
            return Err(Error::InvalidInput(format!(
                "column '{}' has {} row(s), expected {n_rows}",
                columns[bad],
                data[bad].len()
            )));
        }
        let mut values = Vec::with_capacity(n_rows * columns.len());
        for i in 0..n_rows {
            values.extend(data.iter().map(|c| c[i]));
        }
        Ok(Self {
            columns,
            values,
            n_rows,
        })
    }

    /// Number of rows.
    #[must_use]
    pub const fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of feature columns.
    #[must_use]
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Feature names in column order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Row `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_rows()`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        let width = self.columns.len();
        &self.values[i * width..(i + 1) * width]
    }

    /// Single cell.
    #[must_use]
    pub fn value(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.columns.len() + j]
    }

    /// Copy of column `j`.
    #[must_use]
    pub fn column(&self, j: usize) -> Vec<f64> {
        (0..self.n_rows).map(|i| self.value(i, j)).collect()
    }
}

/// Read-only slice of the tabular store (one store context, one date range).
#[derive(Debug, Clone)]
pub struct Frame {
    batch: RecordBatch,
}

impl Frame {
    /// Wrap a record batch.
    #[must_use]
    pub const fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    /// Underlying Arrow batch.
    #[must_use]
    pub const fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// True when the slice has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    fn column(&self, name: &str) -> Result<&ArrayRef> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("column '{name}'")))
    }

    /// Row dates.
    ///
    /// # Errors
    ///
    /// Fails when the date column is missing or holds null/unparseable values.
    pub fn dates(&self) -> Result<Vec<NaiveDate>> {
        decode_dates(self.column(DATE_COLUMN)?)?
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                d.ok_or_else(|| Error::StorageError(format!("row {i}: null or invalid date")))
            })
            .collect()
    }

    /// Target column as `f64`.
    ///
    /// # Errors
    ///
    /// Fails when the column is missing, not numeric, or contains nulls.
    pub fn target(&self, name: &str) -> Result<Vec<f64>> {
        let values = numeric_column(self.column(name)?)?;
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                v.ok_or_else(|| {
                    Error::StorageError(format!("target '{name}' is null at row {i}"))
                })
            })
            .collect()
    }

    /// Feature matrix for `names`, in the given order.
    ///
    /// Stored columns are cast to `f64` with nulls filled by the column mean
    /// of this slice. Calendar features are derived from the date column
    /// when no stored column of that name exists.
    ///
    /// # Errors
    ///
    /// Fails for unknown or non-numeric columns.
    pub fn features(&self, names: &[String]) -> Result<FeatureMatrix> {
        let mut data = Vec::with_capacity(names.len());
        let mut dates: Option<Vec<NaiveDate>> = None;

        for name in names {
            if let Some(array) = self.batch.column_by_name(name) {
                data.push(fill_nulls_with_mean(numeric_column(array)?));
            } else if CALENDAR_FEATURES.contains(&name.as_str()) {
                if dates.is_none() {
                    dates = Some(self.dates()?);
                }
                let days = dates.as_deref().unwrap_or_default();
                data.push(days.iter().map(|d| calendar_value(name, *d)).collect());
            } else {
                return Err(Error::InvalidInput(format!(
                    "unknown feature column '{name}'"
                )));
            }
        }

        if names.is_empty() {
            return FeatureMatrix::from_rows(Vec::new(), &vec![Vec::new(); self.num_rows()]);
        }
        FeatureMatrix::from_columns(names.to_vec(), &data)
    }
}

fn calendar_value(name: &str, date: NaiveDate) -> f64 {
    match name {
        "day_of_month" => f64::from(date.day()),
        "day_of_week" => f64::from(date.weekday().num_days_from_monday()),
        _ => f64::from(date.month()),
    }
}

fn numeric_column(array: &ArrayRef) -> Result<Vec<Option<f64>>> {
    if !array.data_type().is_numeric() {
        return Err(Error::InvalidInput(format!(
            "column of type {:?} is not numeric",
            array.data_type()
        )));
    }
    let cast = compute::cast(array, &DataType::Float64)?;
    let values = cast
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| Error::Other("Failed to downcast to Float64Array".to_string()))?;
    Ok(values.iter().collect())
}

#[allow(clippy::cast_precision_loss)]
fn fill_nulls_with_mean(values: Vec<Option<f64>>) -> Vec<f64> {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    let mean = if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    };
    values.into_iter().map(|v| v.unwrap_or(mean)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};
    use std::sync::Arc;

    fn frame() -> Frame {
        let schema = Schema::new(vec![
            Field::new("date", DataType::Date32, false),
            Field::new("sales", DataType::Float64, false),
            Field::new("oil", DataType::Float64, true),
            Field::new("onpromotion", DataType::Int32, false),
        ]);
        let start = naive_to_date32(NaiveDate::from_ymd_opt(2017, 1, 2).unwrap());
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Date32Array::from(vec![start, start + 1, start + 2])),
                Arc::new(Float64Array::from(vec![10.0, 11.0, 12.0])),
                Arc::new(Float64Array::from(vec![Some(50.0), None, Some(54.0)])),
                Arc::new(arrow::array::Int32Array::from(vec![0, 3, 1])),
            ],
        )
        .map(Frame::new)
        .unwrap()
    }

    #[test]
    fn test_date32_roundtrip_epoch() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(naive_to_date32(epoch), 0);
        assert_eq!(date32_to_naive(0), Some(epoch));
    }

    #[test]
    fn test_features_fill_nulls_and_cast_ints() {
        let x = frame()
            .features(&["oil".to_string(), "onpromotion".to_string()])
            .unwrap();
        assert_eq!(x.n_rows(), 3);
        assert_eq!(x.row(1), &[52.0, 3.0]);
    }

    #[test]
    fn test_calendar_features_derived_from_date() {
        let names: Vec<String> = CALENDAR_FEATURES.iter().map(ToString::to_string).collect();
        let x = frame().features(&names).unwrap();
        // 2017-01-02 is a Monday
        assert_eq!(x.row(0), &[2.0, 0.0, 1.0]);
        assert_eq!(x.row(2), &[4.0, 2.0, 1.0]);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        assert!(frame().features(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_target_and_dates() {
        let f = frame();
        assert_eq!(f.target("sales").unwrap(), vec![10.0, 11.0, 12.0]);
        assert_eq!(f.dates().unwrap()[0], NaiveDate::from_ymd_opt(2017, 1, 2).unwrap());
        assert!(f.target("missing").is_err());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = FeatureMatrix::from_rows(vec!["a".into()], &[vec![1.0], vec![1.0, 2.0]]);
        assert!(result.is_err());
    }
}
