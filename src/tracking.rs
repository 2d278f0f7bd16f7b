use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ExecutorKind;
use crate::domain::UnitKey;
use crate::error::ConductorError;
use crate::fs_util;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub executor: ExecutorKind,
    pub id: String,
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.executor {
            ExecutorKind::Local => write!(f, "pid {}", self.id),
            ExecutorKind::Slurm => write!(f, "slurm job {}", self.id),
        }
    }
}

/// What the sweep needs to poll a launched process and report its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub workflow: String,
    pub engine: String,
    pub process: ProcessHandle,
    pub project_base_path: Utf8PathBuf,
    pub analysis_dir: Utf8PathBuf,
    pub results_dir: Utf8PathBuf,
    pub work_dir: Utf8PathBuf,
    pub exit_code_path: Utf8PathBuf,
    #[serde(default)]
    pub run_dir: Option<Utf8PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackingEntry {
    key: UnitKey,
    record: TrackingRecord,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackingFile {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    entries: Vec<TrackingEntry>,
}

/// File-backed record of in-flight processes. Every access goes through a
/// guard that holds an advisory lock on `<path>.lock` until dropped.
#[derive(Debug, Clone)]
pub struct TrackingStore {
    path: Utf8PathBuf,
}

impl TrackingStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn lock_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.lock", self.path))
    }

    pub fn open_for_read(&self) -> Result<TrackingReadGuard, ConductorError> {
        let lock = StoreLock::acquire(&self.lock_path(), LockMode::Shared)?;
        let entries = load_entries(&self.path)?;
        Ok(TrackingReadGuard {
            _lock: lock,
            entries,
        })
    }

    pub fn open_for_write(&self) -> Result<TrackingWriteGuard, ConductorError> {
        let lock = StoreLock::acquire(&self.lock_path(), LockMode::Exclusive)?;
        let entries = load_entries(&self.path)?;
        Ok(TrackingWriteGuard {
            _lock: lock,
            path: self.path.clone(),
            entries,
            dirty: false,
        })
    }

    /// Returns `false` when `key` is already tracked; the stored record is kept.
    pub fn record(&self, key: &UnitKey, record: TrackingRecord) -> Result<bool, ConductorError> {
        let mut guard = self.open_for_write()?;
        let inserted = guard.record(key, record);
        guard.commit()?;
        Ok(inserted)
    }

    pub fn remove(&self, key: &UnitKey) -> Result<TrackingRecord, ConductorError> {
        let mut guard = self.open_for_write()?;
        let removed = guard.remove(key)?;
        guard.commit()?;
        Ok(removed)
    }

    pub fn all_records(&self) -> Result<BTreeMap<UnitKey, TrackingRecord>, ConductorError> {
        Ok(self.open_for_read()?.all_records())
    }
}

pub struct TrackingReadGuard {
    _lock: StoreLock,
    entries: Vec<TrackingEntry>,
}

impl TrackingReadGuard {
    pub fn get(&self, key: &UnitKey) -> Option<&TrackingRecord> {
        find(&self.entries, key)
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.get(key).is_some()
    }

    pub fn all_records(&self) -> BTreeMap<UnitKey, TrackingRecord> {
        snapshot(&self.entries)
    }

    /// Keys of the sample itself and of anything tracked below it.
    pub fn keys_within_sample(&self, project: &str, sample: &str) -> Vec<UnitKey> {
        keys_within_sample(&self.entries, project, sample)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Changes are written only by [`TrackingWriteGuard::commit`]; dropping the
/// guard without committing discards them and releases the lock.
pub struct TrackingWriteGuard {
    _lock: StoreLock,
    path: Utf8PathBuf,
    entries: Vec<TrackingEntry>,
    dirty: bool,
}

impl TrackingWriteGuard {
    pub fn get(&self, key: &UnitKey) -> Option<&TrackingRecord> {
        find(&self.entries, key)
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.get(key).is_some()
    }

    pub fn all_records(&self) -> BTreeMap<UnitKey, TrackingRecord> {
        snapshot(&self.entries)
    }

    pub fn keys_within_sample(&self, project: &str, sample: &str) -> Vec<UnitKey> {
        keys_within_sample(&self.entries, project, sample)
    }

    pub fn record(&mut self, key: &UnitKey, record: TrackingRecord) -> bool {
        if self.contains(key) {
            warn!(
                unit = %key,
                "tracking record already exists, not recording {}",
                record.process
            );
            return false;
        }
        debug!(unit = %key, process = %record.process, "recording process");
        self.entries.push(TrackingEntry {
            key: key.clone(),
            record,
        });
        self.dirty = true;
        true
    }

    pub fn remove(&mut self, key: &UnitKey) -> Result<TrackingRecord, ConductorError> {
        let index = self
            .entries
            .iter()
            .position(|entry| &entry.key == key)
            .ok_or_else(|| ConductorError::TrackingRecordMissing(key.to_string()))?;
        self.dirty = true;
        Ok(self.entries.remove(index).record)
    }

    pub fn commit(self) -> Result<(), ConductorError> {
        if !self.dirty {
            return Ok(());
        }
        let file = TrackingFile {
            schema_version: SCHEMA_VERSION,
            entries: self.entries,
        };
        let content = serde_json::to_vec_pretty(&file)
            .map_err(|err| ConductorError::TrackingStore(err.to_string()))?;
        fs_util::write_atomic(&self.path, &content)
            .map_err(|err| ConductorError::TrackingStore(format!("write {}: {err}", self.path)))
    }
}

fn find<'a>(entries: &'a [TrackingEntry], key: &UnitKey) -> Option<&'a TrackingRecord> {
    entries
        .iter()
        .find(|entry| &entry.key == key)
        .map(|entry| &entry.record)
}

fn snapshot(entries: &[TrackingEntry]) -> BTreeMap<UnitKey, TrackingRecord> {
    entries
        .iter()
        .map(|entry| (entry.key.clone(), entry.record.clone()))
        .collect()
}

fn keys_within_sample(entries: &[TrackingEntry], project: &str, sample: &str) -> Vec<UnitKey> {
    entries
        .iter()
        .filter(|entry| entry.key.within_sample(project, sample))
        .map(|entry| entry.key.clone())
        .collect()
}

fn load_entries(path: &Utf8Path) -> Result<Vec<TrackingEntry>, ConductorError> {
    if !path.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let content = fs::read(path.as_std_path())
        .map_err(|err| ConductorError::TrackingStore(format!("read {path}: {err}")))?;
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let file: TrackingFile = serde_json::from_slice(&content)
        .map_err(|err| ConductorError::TrackingStore(format!("parse {path}: {err}")))?;
    Ok(file.entries)
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

struct StoreLock {
    // NOTE(lifetime): the advisory lock lives as long as this handle
    file: File,
}

impl StoreLock {
    fn acquire(path: &Utf8Path, mode: LockMode) -> Result<Self, ConductorError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| ConductorError::TrackingStore(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|err| ConductorError::TrackingStore(format!("open {path}: {err}")))?;
        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked.map_err(|err| ConductorError::TrackingStore(format!("lock {path}: {err}")))?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
