//! Prediction and model artifact stores.
//!
//! - [`MemoryArtifactStore`]: `DashMap`-backed, data is lost on process exit
//! - [`FsArtifactStore`]: one directory per run, predictions as Parquet,
//!   model snapshots as JSON; every file is written to a temporary name and
//!   renamed into place, so readers never see a partial artifact

use arrow::array::{Array, Date32Array, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use dashmap::DashMap;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{ArtifactKind, ArtifactRecord};
use crate::storage::{date32_to_naive, naive_to_date32};
use crate::{Error, Result};

/// Which slice a prediction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Training slice (in-sample)
    Train,
    /// Validation slice (out-of-sample)
    Validation,
}

impl Partition {
    /// Lowercase partition name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "validation" => Ok(Self::Validation),
            other => Err(Error::StorageError(format!("unknown partition '{other}'"))),
        }
    }
}

/// One predicted row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    /// Source slice
    pub partition: Partition,
    /// Row date
    pub date: NaiveDate,
    /// Observed target
    pub actual: f64,
    /// Model output
    pub predicted: f64,
}

/// Predictions of one run on both partitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    rows: Vec<PredictionRow>,
}

impl Predictions {
    /// Empty prediction set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one partition's rows.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the column lengths differ.
    pub fn extend_partition(
        &mut self,
        partition: Partition,
        dates: &[NaiveDate],
        actual: &[f64],
        predicted: &[f64],
    ) -> Result<()> {
        if dates.len() != actual.len() || actual.len() != predicted.len() {
            return Err(Error::InvalidInput(format!(
                "{} partition: {} dates, {} actuals, {} predictions",
                partition.as_str(),
                dates.len(),
                actual.len(),
                predicted.len()
            )));
        }
        self.rows.extend(
            dates
                .iter()
                .zip(actual.iter().zip(predicted))
                .map(|(date, (actual, predicted))| PredictionRow {
                    partition,
                    date: *date,
                    actual: *actual,
                    predicted: *predicted,
                }),
        );
        Ok(())
    }

    /// All rows, train first.
    #[must_use]
    pub fn rows(&self) -> &[PredictionRow] {
        &self.rows
    }

    /// Rows of one partition.
    pub fn partition(&self, partition: Partition) -> impl Iterator<Item = &PredictionRow> {
        self.rows.iter().filter(move |r| r.partition == partition)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("partition", DataType::Utf8, false),
            Field::new("date", DataType::Date32, false),
            Field::new("actual", DataType::Float64, false),
            Field::new("predicted", DataType::Float64, false),
        ]))
    }

    fn to_batch(&self) -> Result<RecordBatch> {
        Ok(RecordBatch::try_new(
            Self::schema(),
            vec![
                Arc::new(StringArray::from_iter_values(
                    self.rows.iter().map(|r| r.partition.as_str()),
                )),
                Arc::new(Date32Array::from_iter_values(
                    self.rows.iter().map(|r| naive_to_date32(r.date)),
                )),
                Arc::new(Float64Array::from_iter_values(self.rows.iter().map(|r| r.actual))),
                Arc::new(Float64Array::from_iter_values(
                    self.rows.iter().map(|r| r.predicted),
                )),
            ],
        )?)
    }

    fn extend_from_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        let partitions = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| Error::Other("Failed to downcast to StringArray".to_string()))?;
        let dates = batch
            .column(1)
            .as_any()
            .downcast_ref::<Date32Array>()
            .ok_or_else(|| Error::Other("Failed to downcast to Date32Array".to_string()))?;
        let actual = batch
            .column(2)
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| Error::Other("Failed to downcast to Float64Array".to_string()))?;
        let predicted = batch
            .column(3)
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| Error::Other("Failed to downcast to Float64Array".to_string()))?;

        for i in 0..batch.num_rows() {
            let date = date32_to_naive(dates.value(i))
                .ok_or_else(|| Error::StorageError(format!("invalid date at row {i}")))?;
            self.rows.push(PredictionRow {
                partition: Partition::parse(partitions.value(i))?,
                date,
                actual: actual.value(i),
                predicted: predicted.value(i),
            });
        }
        Ok(())
    }
}

/// Serialized fitted model plus what is needed to feed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    /// Estimator kind able to restore `state`
    pub estimator_kind: String,
    /// Feature columns in training order
    pub features: Vec<String>,
    /// Estimator-specific state
    pub state: serde_json::Value,
}

/// Storage for per-run artifacts.
pub trait ArtifactStore: Send + Sync {
    /// Store the predictions of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the artifact cannot be written.
    fn put_predictions(&self, run_id: &str, predictions: &Predictions) -> Result<ArtifactRecord>;

    /// Load predictions referenced by `artifact`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown artifacts.
    fn load_predictions(&self, artifact: &ArtifactRecord) -> Result<Predictions>;

    /// Store the model snapshot of `run_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the artifact cannot be written.
    fn put_model(&self, run_id: &str, snapshot: &ModelSnapshot) -> Result<ArtifactRecord>;

    /// Load the model snapshot referenced by `artifact`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown artifacts.
    fn load_model(&self, artifact: &ArtifactRecord) -> Result<ModelSnapshot>;

    /// Delete every artifact of `run_id`; a run without artifacts is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error if artifacts exist but cannot be removed.
    fn remove_run(&self, run_id: &str) -> Result<()>;
}

fn expect_kind(artifact: &ArtifactRecord, kind: ArtifactKind) -> Result<()> {
    if artifact.kind() == kind {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "artifact '{}' is {:?}, expected {kind:?}",
            artifact.key(),
            artifact.kind()
        )))
    }
}

/// In-memory artifact store using lock-free concurrent hashmaps.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    predictions: DashMap<String, Predictions>,
    models: DashMap<String, ModelSnapshot>,
}

impl MemoryArtifactStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.predictions.len() + self.models.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put_predictions(&self, run_id: &str, predictions: &Predictions) -> Result<ArtifactRecord> {
        let key = format!("mem://{run_id}/predictions");
        let size = (predictions.len() * std::mem::size_of::<PredictionRow>()) as u64;
        self.predictions.insert(key.clone(), predictions.clone());
        Ok(ArtifactRecord::new(run_id, key, ArtifactKind::Predictions, size))
    }

    fn load_predictions(&self, artifact: &ArtifactRecord) -> Result<Predictions> {
        expect_kind(artifact, ArtifactKind::Predictions)?;
        self.predictions
            .get(artifact.key())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("artifact '{}'", artifact.key())))
    }

    fn put_model(&self, run_id: &str, snapshot: &ModelSnapshot) -> Result<ArtifactRecord> {
        let key = format!("mem://{run_id}/model");
        let size = serde_json::to_vec(snapshot)?.len() as u64;
        self.models.insert(key.clone(), snapshot.clone());
        Ok(ArtifactRecord::new(run_id, key, ArtifactKind::Model, size))
    }

    fn load_model(&self, artifact: &ArtifactRecord) -> Result<ModelSnapshot> {
        expect_kind(artifact, ArtifactKind::Model)?;
        self.models
            .get(artifact.key())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("artifact '{}'", artifact.key())))
    }

    fn remove_run(&self, run_id: &str) -> Result<()> {
        self.predictions.remove(&format!("mem://{run_id}/predictions"));
        self.models.remove(&format!("mem://{run_id}/model"));
        Ok(())
    }
}

/// Filesystem artifact store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create) the store directory.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(Error::InvalidInput(format!("unsafe run id '{run_id}'")));
        }
        Ok(self.root.join("runs").join(run_id))
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.run_path(run_id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn resolve(&self, artifact: &ArtifactRecord) -> Result<PathBuf> {
        let path = self.root.join(artifact.key());
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::NotFound(format!("artifact '{}'", artifact.key())))
        }
    }

    /// Write via `<name>.tmp` then rename.
    fn write_atomic(path: &Path, write: impl FnOnce(&mut File) -> Result<()>) -> Result<u64> {
        let tmp = path.with_extension("tmp");
        let result = (|| {
            let mut file = File::create(&tmp)?;
            write(&mut file)?;
            file.sync_all()?;
            Ok::<_, Error>(file.metadata()?.len())
        })();
        match result {
            Ok(size) => {
                fs::rename(&tmp, path)?;
                Ok(size)
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    fn key_for(run_id: &str, file: &str) -> String {
        format!("runs/{run_id}/{file}")
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put_predictions(&self, run_id: &str, predictions: &Predictions) -> Result<ArtifactRecord> {
        let path = self.run_dir(run_id)?.join("predictions.parquet");
        let batch = predictions.to_batch()?;
        let size = Self::write_atomic(&path, |file| {
            let mut writer = ArrowWriter::try_new(file.try_clone()?, batch.schema(), None)?;
            writer.write(&batch)?;
            writer.close()?;
            Ok(())
        })?;
        Ok(ArtifactRecord::new(
            run_id,
            Self::key_for(run_id, "predictions.parquet"),
            ArtifactKind::Predictions,
            size,
        ))
    }

    fn load_predictions(&self, artifact: &ArtifactRecord) -> Result<Predictions> {
        expect_kind(artifact, ArtifactKind::Predictions)?;
        let file = File::open(self.resolve(artifact)?)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
        let mut predictions = Predictions::new();
        for batch in reader {
            predictions.extend_from_batch(&batch?)?;
        }
        Ok(predictions)
    }

    fn put_model(&self, run_id: &str, snapshot: &ModelSnapshot) -> Result<ArtifactRecord> {
        let path = self.run_dir(run_id)?.join("model.json");
        let bytes = serde_json::to_vec(snapshot)?;
        let size = Self::write_atomic(&path, |file| Ok(file.write_all(&bytes)?))?;
        Ok(ArtifactRecord::new(
            run_id,
            Self::key_for(run_id, "model.json"),
            ArtifactKind::Model,
            size,
        ))
    }

    fn load_model(&self, artifact: &ArtifactRecord) -> Result<ModelSnapshot> {
        expect_kind(artifact, ArtifactKind::Model)?;
        let bytes = fs::read(self.resolve(artifact)?)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn remove_run(&self, run_id: &str) -> Result<()> {
        match fs::remove_dir_all(self.run_path(run_id)?) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Predictions {
        let d = |day| NaiveDate::from_ymd_opt(2017, 6, day).unwrap();
        let mut p = Predictions::new();
        p.extend_partition(Partition::Train, &[d(1), d(2)], &[1.0, 2.0], &[1.1, 1.9])
            .unwrap();
        p.extend_partition(Partition::Validation, &[d(3)], &[3.0], &[2.5])
            .unwrap();
        p
    }

    fn snapshot() -> ModelSnapshot {
        ModelSnapshot {
            estimator_kind: "mean".to_string(),
            features: vec!["onpromotion".to_string()],
            state: serde_json::json!({"value": 2.0, "n_features": 1}),
        }
    }

    #[test]
    fn test_partition_length_mismatch_rejected() {
        let mut p = Predictions::new();
        let d = NaiveDate::from_ymd_opt(2017, 1, 1).unwrap();
        assert!(p
            .extend_partition(Partition::Train, &[d], &[1.0, 2.0], &[1.0])
            .is_err());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryArtifactStore::new();
        let record = store.put_predictions("run-1", &sample()).unwrap();
        assert_eq!(store.load_predictions(&record).unwrap(), sample());
        let model = store.put_model("run-1", &snapshot()).unwrap();
        assert_eq!(store.load_model(&model).unwrap(), snapshot());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_fs_store_parquet_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let record = store.put_predictions("run-1", &sample()).unwrap();
        assert_eq!(record.key(), "runs/run-1/predictions.parquet");
        assert!(record.size_bytes() > 0);
        assert!(!dir.path().join("runs/run-1/predictions.tmp").exists());

        let loaded = store.load_predictions(&record).unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(loaded.partition(Partition::Validation).count(), 1);
    }

    #[test]
    fn test_fs_store_model_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        let record = store.put_model("run-1", &snapshot()).unwrap();
        assert_eq!(store.load_model(&record).unwrap(), snapshot());
    }

    #[test]
    fn test_kind_mismatch_and_missing() {
        let store = MemoryArtifactStore::new();
        let model = store.put_model("run-1", &snapshot()).unwrap();
        assert!(store.load_predictions(&model).is_err());

        let missing = ArtifactRecord::new("run-2", "mem://run-2/model", ArtifactKind::Model, 0);
        assert!(matches!(store.load_model(&missing), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_run_clears_artifacts() {
        let memory = MemoryArtifactStore::new();
        let model = memory.put_model("run-1", &snapshot()).unwrap();
        memory.put_predictions("run-1", &sample()).unwrap();
        memory.remove_run("run-1").unwrap();
        assert!(memory.is_empty());
        assert!(matches!(memory.load_model(&model), Err(Error::NotFound(_))));

        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsArtifactStore::open(dir.path()).unwrap();
        fs_store.put_model("run-1", &snapshot()).unwrap();
        fs_store.put_predictions("run-1", &sample()).unwrap();
        fs_store.remove_run("run-1").unwrap();
        assert!(!dir.path().join("runs/run-1").exists());
        fs_store.remove_run("never-written").unwrap();
    }

    #[test]
    fn test_fs_store_rejects_path_like_run_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).unwrap();
        assert!(store.put_model("../escape", &snapshot()).is_err());
    }
}
