//! Tabular store and data partition provider (Arrow/Parquet)
//!
//! **Read-Only During Sweeps** (Append-Only Load Pattern):
//! - The sales table is loaded once from Parquet and shared by every run
//! - Write pattern: append whole batches before a sweep starts
//! - Runs only ever see immutable slices ([`Frame`]) of it
//!
//! ## Schema
//!
//! | column          | type              | notes                          |
//! |-----------------|-------------------|--------------------------------|
//! | `store_context` | Utf8              | partitioning key (store type)  |
//! | `date`          | Date32 or Utf8    | ISO-8601 when Utf8             |
//! | target          | numeric           | `sales` unless configured      |
//! | features        | numeric, nullable | nulls filled with slice mean   |
//!
//! Toyota Way Principles:
//! - Poka-Yoke: empty train/validation slices fail the run before fitting
//! - Muda elimination: slices are filtered per batch, then concatenated once

mod frame;

pub use frame::{
    date32_to_naive, decode_dates, naive_to_date32, FeatureMatrix, Frame, CALENDAR_FEATURES,
};

use crate::experiment::{DateRange, ValidationPolicy};
use crate::{Error, Result};
use arrow::array::{Array, BooleanArray, StringArray, UInt32Array};
use arrow::compute;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use std::path::Path;
use tracing::debug;

/// Partitioning key column.
pub const STORE_CONTEXT_COLUMN: &str = "store_context";

/// Row date column.
pub const DATE_COLUMN: &str = "date";

/// Train and validation slices for one experiment spec.
#[derive(Debug, Clone)]
pub struct Partitions {
    /// Training rows, date ordered
    pub train: Frame,
    /// Validation rows, date ordered
    pub validation: Frame,
}

/// Source of immutable data slices for runs.
///
/// Implementations must be safe to share across worker threads; every call
/// returns fresh views and never mutates the underlying data.
pub trait PartitionProvider: Send + Sync {
    /// Resolve train/validation slices for `store_context` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unresolvable policy or an empty slice.
    fn partitions(&self, store_context: &str, policy: &ValidationPolicy) -> Result<Partitions>;

    /// Rows of `store_context` within `range` (inference input).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the slice cannot be built.
    fn inference(&self, store_context: &str, range: DateRange) -> Result<Frame>;

    /// Distinct store contexts, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the context column is unreadable.
    fn store_contexts(&self) -> Result<Vec<String>>;
}

/// In-memory tabular store backed by Arrow record batches
#[derive(Debug, Clone, Default)]
pub struct TabularStore {
    batches: Vec<RecordBatch>,
}

impl TabularStore {
    /// Create a store from existing batches
    ///
    /// Useful for testing and benchmarking
    #[must_use]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches }
    }

    /// Load table from Parquet file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
        use std::fs::File;

        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::StorageError(format!("Failed to open Parquet file {}: {e}", path.display()))
        })?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?
            .build()
            .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

        let batches = reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?;

        let store = Self { batches };
        debug!(path = %path.display(), rows = store.num_rows(), "loaded tabular store");
        Ok(store)
    }

    /// Get all record batches
    #[must_use]
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total row count.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Append a batch (the only write operation).
    ///
    /// # Errors
    ///
    /// Returns error if batch schema doesn't match existing batches
    pub fn append_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if let Some(first) = self.batches.first() {
            if batch.schema() != first.schema() {
                return Err(Error::StorageError(format!(
                    "Schema mismatch: expected {:?}, got {:?}",
                    first.schema(),
                    batch.schema()
                )));
            }
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Rows of `store_context` within `range`, sorted by date.
    ///
    /// # Errors
    ///
    /// Fails if the context or date columns are missing or mistyped.
    pub fn slice(&self, store_context: &str, range: DateRange) -> Result<Frame> {
        let Some(first) = self.batches.first() else {
            return Err(Error::StorageError("tabular store is empty".to_string()));
        };
        let schema = first.schema();

        let mut parts = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            let mask = row_mask(batch, store_context, range)?;
            parts.push(compute::filter_record_batch(batch, &mask)?);
        }
        let merged = compute::concat_batches(&schema, &parts)?;
        Ok(Frame::new(sort_by_date(&merged)?))
    }
}

fn context_column(batch: &RecordBatch) -> Result<StringArray> {
    let column = batch
        .column_by_name(STORE_CONTEXT_COLUMN)
        .ok_or_else(|| Error::StorageError(format!("missing column '{STORE_CONTEXT_COLUMN}'")))?;
    let cast = compute::cast(column, &DataType::Utf8)?;
    cast.as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| Error::Other("Failed to downcast to StringArray".to_string()))
}

fn row_mask(batch: &RecordBatch, store_context: &str, range: DateRange) -> Result<BooleanArray> {
    let contexts = context_column(batch)?;
    let dates = decode_dates(
        batch
            .column_by_name(DATE_COLUMN)
            .ok_or_else(|| Error::StorageError(format!("missing column '{DATE_COLUMN}'")))?,
    )?;
    Ok((0..batch.num_rows())
        .map(|i| {
            let in_context = !contexts.is_null(i) && contexts.value(i) == store_context;
            Some(in_context && dates[i].is_some_and(|d| range.contains(d)))
        })
        .collect())
}

/// Stable sort by date so ties keep storage order.
#[allow(clippy::cast_possible_truncation)]
fn sort_by_date(batch: &RecordBatch) -> Result<RecordBatch> {
    let Some(column) = batch.column_by_name(DATE_COLUMN) else {
        return Ok(batch.clone());
    };
    let dates = decode_dates(column)?;
    let mut order: Vec<u32> = (0..batch.num_rows() as u32).collect();
    order.sort_by_key(|&i| dates[i as usize]);
    let indices = UInt32Array::from(order);
    let columns = batch
        .columns()
        .iter()
        .map(|c| compute::take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

impl PartitionProvider for TabularStore {
    fn partitions(&self, store_context: &str, policy: &ValidationPolicy) -> Result<Partitions> {
        let (train_range, valid_range) = policy.resolve()?;
        let train = self.slice(store_context, train_range)?;
        let validation = self.slice(store_context, valid_range)?;
        debug!(
            store_context,
            train_rows = train.num_rows(),
            validation_rows = validation.num_rows(),
            "resolved partitions"
        );
        if train.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no training rows for '{store_context}' in {} ..= {}",
                train_range.start, train_range.end
            )));
        }
        if validation.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no validation rows for '{store_context}' in {} ..= {}",
                valid_range.start, valid_range.end
            )));
        }
        Ok(Partitions { train, validation })
    }

    fn inference(&self, store_context: &str, range: DateRange) -> Result<Frame> {
        self.slice(store_context, range)
    }

    fn store_contexts(&self) -> Result<Vec<String>> {
        let mut contexts = std::collections::BTreeSet::new();
        for batch in &self.batches {
            let column = context_column(batch)?;
            contexts.extend(column.iter().flatten().map(str::to_string));
        }
        Ok(contexts.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Date32Array, Float64Array};
    use arrow::datatypes::{Field, Schema};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2017, m, d).unwrap()
    }

    fn create_test_batch(rows: &[(&str, NaiveDate, f64)]) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::new(STORE_CONTEXT_COLUMN, DataType::Utf8, false),
            Field::new(DATE_COLUMN, DataType::Date32, false),
            Field::new("sales", DataType::Float64, false),
        ]);
        RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.0))),
                Arc::new(Date32Array::from_iter_values(
                    rows.iter().map(|r| naive_to_date32(r.1)),
                )),
                Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.2))),
            ],
        )
        .unwrap()
    }

    fn store() -> TabularStore {
        TabularStore::new(vec![
            create_test_batch(&[
                ("A", date(1, 3), 3.0),
                ("B", date(1, 1), 100.0),
                ("A", date(1, 1), 1.0),
            ]),
            create_test_batch(&[("A", date(1, 2), 2.0), ("A", date(1, 4), 4.0)]),
        ])
    }

    #[test]
    fn test_slice_filters_context_and_sorts_by_date() {
        let frame = store()
            .slice("A", DateRange::new(date(1, 1), date(1, 3)).unwrap())
            .unwrap();
        assert_eq!(frame.target("sales").unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_partitions_split_by_policy() {
        let policy = ValidationPolicy::DateRange {
            train_start: date(1, 1),
            train_end: date(1, 2),
            valid_start: date(1, 3),
            valid_end: date(1, 4),
        };
        let parts = store().partitions("A", &policy).unwrap();
        assert_eq!(parts.train.num_rows(), 2);
        assert_eq!(parts.validation.target("sales").unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_empty_validation_slice_rejected() {
        let policy = ValidationPolicy::Cutoff {
            cutoff: date(1, 4),
            horizon_days: 7,
            lookback_days: None,
        };
        let err = store().partitions("A", &policy).unwrap_err();
        assert!(err.to_string().contains("no validation rows"));
    }

    #[test]
    fn test_store_contexts_sorted_distinct() {
        assert_eq!(store().store_contexts().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn test_append_batch_schema_validation() {
        let mut storage = store();
        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)])),
            vec![Arc::new(Float64Array::from(vec![1.0]))],
        )
        .unwrap();
        let result = storage.append_batch(other);
        assert!(result.unwrap_err().to_string().contains("Schema mismatch"));
    }

    #[test]
    fn test_load_parquet_missing_file() {
        let err = TabularStore::load_parquet("/nonexistent/sales.parquet").unwrap_err();
        assert!(err.to_string().contains("Failed to open Parquet file"));
    }
}
