//! Append-only JSON-lines run log.
//!
//! One `RunRecord` per line in `<dir>/runs.jsonl`:
//! - appends are serialised by a single-writer mutex and `fsync`ed
//! - a failed write is truncated back to the last committed line
//! - a partial trailing line (crash mid-append) is cut off on open
//! - unparseable complete lines are skipped with a warning
//!
//! Readers only ever see indexed lines: one record per `run_id`, up to the
//! last committed append.

use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{MetricIndex, RunFilter, RunIter, RunRecord, RunRepository};
use crate::{Error, Result};

/// Run log file name inside the store directory.
pub const RUN_LOG_FILE: &str = "runs.jsonl";

#[derive(Debug, Clone, Copy)]
struct LineRef {
    offset: u64,
    len: usize,
}

#[derive(Debug)]
struct State {
    file: File,
    committed_len: u64,
    lines: Vec<LineRef>,
    by_id: FxHashMap<String, usize>,
    by_experiment: FxHashMap<(String, String), Vec<usize>>,
    execution_names: BTreeSet<String>,
    metrics: MetricIndex,
}

impl State {
    fn index(&mut self, line: LineRef, record: &RunRecord) {
        let slot = self.lines.len();
        self.lines.push(line);
        self.by_id.insert(record.run_id().to_string(), slot);
        self.by_experiment
            .entry((
                record.execution_name().to_string(),
                record.experiment_id().to_string(),
            ))
            .or_default()
            .push(slot);
        self.execution_names
            .insert(record.execution_name().to_string());
        self.metrics.insert(record, slot);
    }
}

/// Durable run repository backed by a JSON-lines file.
#[derive(Debug)]
pub struct JsonlRunRepository {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonlRunRepository {
    /// Open (or create) the run log in `dir` and index its records.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory or file cannot be opened.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(RUN_LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut state = State {
            file: file.try_clone()?,
            committed_len: 0,
            lines: Vec::new(),
            by_id: FxHashMap::default(),
            by_experiment: FxHashMap::default(),
            execution_names: BTreeSet::new(),
            metrics: MetricIndex::default(),
        };

        file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut file);
        let mut buf = Vec::new();
        let mut offset = 0_u64;
        let mut skipped = 0_usize;
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                warn!(path = %path.display(), offset, bytes = n, "truncating partial trailing run record");
                break;
            }
            match serde_json::from_slice::<RunRecord>(&buf[..n - 1]) {
                Ok(record) if !state.by_id.contains_key(record.run_id()) => {
                    state.index(LineRef { offset, len: n - 1 }, &record);
                }
                Ok(record) => {
                    warn!(run_id = record.run_id(), offset, "skipping duplicate run id in log");
                    skipped += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "skipping corrupt run record");
                    skipped += 1;
                }
            }
            offset += n as u64;
        }
        drop(reader);

        if file.metadata()?.len() != offset {
            state.file.set_len(offset)?;
            state.file.sync_all()?;
        }
        state.committed_len = offset;
        debug!(path = %path.display(), runs = state.lines.len(), skipped, "opened run log");

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Path of the run log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of indexed runs.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the writer lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.lines.len())
    }

    /// True when no run is stored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the writer lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::StorageError("run log lock poisoned".to_string()))
    }

    fn read_line(&self, line: LineRef) -> Result<RunRecord> {
        LineReader::open(&self.path)?.read(line)
    }
}

/// Sequential reader over indexed lines; seeks only across skipped lines.
struct LineReader {
    reader: BufReader<File>,
    position: u64,
}

impl LineReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            position: 0,
        })
    }

    fn read(&mut self, line: LineRef) -> Result<RunRecord> {
        if self.position != line.offset {
            self.reader.seek(SeekFrom::Start(line.offset))?;
        }
        // Indexed lines are always newline-terminated.
        let mut buf = vec![0; line.len + 1];
        self.reader.read_exact(&mut buf)?;
        self.position = line.offset + buf.len() as u64;
        Ok(serde_json::from_slice(&buf[..line.len])?)
    }
}

impl RunRepository for JsonlRunRepository {
    fn append(&self, record: RunRecord) -> Result<String> {
        let mut line = serde_json::to_vec(&record)?;
        if line.contains(&b'\n') {
            return Err(Error::InvalidInput(format!(
                "serialized run record '{}' contains a newline",
                record.run_id()
            )));
        }
        line.push(b'\n');

        let mut state = self.lock()?;
        if state.by_id.contains_key(record.run_id()) {
            return Err(Error::DuplicateRunId(record.run_id().to_string()));
        }

        let offset = state.committed_len;
        let written = state
            .file
            .write_all(&line)
            .and_then(|()| state.file.sync_data());
        if let Err(e) = written {
            // Roll back whatever part of the line reached the file.
            if let Err(rollback) = state.file.set_len(offset) {
                warn!(error = %rollback, "failed to truncate partial run record");
            }
            return Err(Error::Io(e));
        }

        state.committed_len = offset + line.len() as u64;
        state.index(
            LineRef {
                offset,
                len: line.len() - 1,
            },
            &record,
        );
        Ok(record.run_id().to_string())
    }

    fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let line = {
            let state = self.lock()?;
            state.by_id.get(run_id).map(|&slot| state.lines[slot])
        };
        line.map(|l| self.read_line(l)).transpose()
    }

    fn scan(&self) -> Result<RunIter<'_>> {
        let lines = self.lock()?.lines.clone();
        let mut reader = LineReader::open(&self.path)?;
        Ok(Box::new(lines.into_iter().map(move |line| reader.read(line))))
    }

    fn execution_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.execution_names.iter().cloned().collect())
    }

    fn query(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let lines: Option<Vec<LineRef>> = {
            let state = self.lock()?;
            state
                .metrics
                .candidates(filter)
                .map(|slots| slots.into_iter().map(|s| state.lines[s]).collect())
        };
        let Some(lines) = lines else {
            let mut out = Vec::new();
            for record in self.scan()? {
                let record = record?;
                if filter.matches(&record) {
                    out.push(record);
                }
            }
            return Ok(out);
        };
        let mut reader = LineReader::open(&self.path)?;
        let mut out = Vec::new();
        for line in lines {
            let record = reader.read(line)?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn runs_for_experiment(&self, execution_name: &str, experiment_id: &str) -> Result<Vec<RunRecord>> {
        let lines: Vec<LineRef> = {
            let state = self.lock()?;
            state
                .by_experiment
                .get(&(execution_name.to_string(), experiment_id.to_string()))
                .map(|slots| slots.iter().map(|&s| state.lines[s]).collect())
                .unwrap_or_default()
        };
        lines.into_iter().map(|l| self.read_line(l)).collect()
    }
}
