//! In-memory run repository.
//!
//! This is the default backend for tests and ephemeral sweeps - data is lost
//! on process exit. For persistence, use [`JsonlRunRepository`](super::JsonlRunRepository).

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{MetricIndex, RunFilter, RunIter, RunRecord, RunRepository};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<RunRecord>,
    by_id: FxHashMap<String, usize>,
    by_experiment: FxHashMap<(String, String), Vec<usize>>,
    execution_names: BTreeSet<String>,
    metrics: MetricIndex,
}

/// Append-only run history held in memory.
///
/// Appends take the write lock, so concurrent writers are serialised and
/// each append is all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryRunRepository {
    inner: RwLock<Inner>,
}

impl MemoryRunRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().map_or(0, |inner| inner.records.len())
    }

    /// True when no run is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::StorageError("run repository lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::StorageError("run repository lock poisoned".to_string()))
    }
}

impl RunRepository for MemoryRunRepository {
    fn append(&self, record: RunRecord) -> Result<String> {
        let mut inner = self.write()?;
        if inner.by_id.contains_key(record.run_id()) {
            return Err(Error::DuplicateRunId(record.run_id().to_string()));
        }
        let slot = inner.records.len();
        let run_id = record.run_id().to_string();
        inner.by_id.insert(run_id.clone(), slot);
        inner
            .by_experiment
            .entry((
                record.execution_name().to_string(),
                record.experiment_id().to_string(),
            ))
            .or_default()
            .push(slot);
        inner
            .execution_names
            .insert(record.execution_name().to_string());
        inner.metrics.insert(&record, slot);
        inner.records.push(record);
        Ok(run_id)
    }

    fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let inner = self.read()?;
        Ok(inner.by_id.get(run_id).map(|&slot| inner.records[slot].clone()))
    }

    fn scan(&self) -> Result<RunIter<'_>> {
        // One short read lock per record; later appends become visible.
        let mut position = 0;
        Ok(Box::new(std::iter::from_fn(move || {
            let inner = match self.read() {
                Ok(inner) => inner,
                Err(e) => return Some(Err(e)),
            };
            let record = inner.records.get(position).cloned()?;
            position += 1;
            Some(Ok(record))
        })))
    }

    fn execution_names(&self) -> Result<Vec<String>> {
        Ok(self.read()?.execution_names.iter().cloned().collect())
    }

    fn query(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let inner = self.read()?;
        Ok(match inner.metrics.candidates(filter) {
            Some(slots) => slots
                .into_iter()
                .map(|s| &inner.records[s])
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
            None => inner
                .records
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect(),
        })
    }

    fn count(&self, filter: &RunFilter) -> Result<usize> {
        let inner = self.read()?;
        Ok(match inner.metrics.candidates(filter) {
            Some(slots) => slots
                .into_iter()
                .filter(|&s| filter.matches(&inner.records[s]))
                .count(),
            None => inner.records.iter().filter(|r| filter.matches(r)).count(),
        })
    }

    fn runs_for_experiment(&self, execution_name: &str, experiment_id: &str) -> Result<Vec<RunRecord>> {
        let inner = self.read()?;
        Ok(inner
            .by_experiment
            .get(&(execution_name.to_string(), experiment_id.to_string()))
            .map(|slots| slots.iter().map(|&s| inner.records[s].clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RunFilter;
    use std::sync::Arc;

    fn run(id: &str, exec: &str, exp: &str) -> RunRecord {
        RunRecord::builder(id, exec, exp).build()
    }

    #[test]
    fn test_append_and_get() {
        let repo = MemoryRunRepository::new();
        assert_eq!(repo.append(run("r1", "s", "e-001")).unwrap(), "r1");
        assert_eq!(repo.get("r1").unwrap().unwrap().experiment_id(), "e-001");
        assert!(repo.get("r2").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_run_id_never_overwrites() {
        let repo = MemoryRunRepository::new();
        repo.append(run("r1", "s", "e-001")).unwrap();
        let err = repo.append(run("r1", "s", "e-002")).unwrap_err();
        assert!(matches!(err, Error::DuplicateRunId(_)));
        assert_eq!(repo.get("r1").unwrap().unwrap().experiment_id(), "e-001");
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_experiment_index_and_execution_names() {
        let repo = MemoryRunRepository::new();
        repo.append(run("r1", "s2", "e-001")).unwrap();
        repo.append(run("r2", "s1", "e-001")).unwrap();
        repo.append(run("r3", "s1", "e-001")).unwrap();
        assert_eq!(repo.execution_names().unwrap(), vec!["s1", "s2"]);
        let runs = repo.runs_for_experiment("s1", "e-001").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(repo.query(&RunFilter::new().execution_name("s2")).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let repo = Arc::new(MemoryRunRepository::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = Arc::clone(&repo);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        repo.append(run(&format!("r{t}-{i}"), "s", "e")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(repo.len(), 200);
        assert_eq!(repo.scan().unwrap().count(), 200);
    }
}
