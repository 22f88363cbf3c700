//! Durable state store.
//!
//! Every record is a single file under the state directory. Mutation goes
//! through [`StateStore::modify`] (read-modify-write) or [`StateStore::append`]
//! (line-delimited logs); both run inside an exclusive per-record lock scope
//! with a bounded wait. [`FileStore`] backs the scope with advisory file locks,
//! [`MemoryStore`] with a mutex.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::lock::FileLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("timed out after {waited_ms}ms waiting for lock {lock}")]
    LockTimeout { lock: String, waited_ms: u64 },
}

/// The records owned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Record {
    Metrics,
    Patterns,
    Incidents,
    FixQueue,
    Tasks,
    ActiveTask,
}

impl Record {
    pub const ALL: [Record; 6] = [
        Record::Metrics,
        Record::Patterns,
        Record::Incidents,
        Record::FixQueue,
        Record::Tasks,
        Record::ActiveTask,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Record::Metrics => "metrics.json",
            Record::Patterns => "patterns.json",
            Record::Incidents => "incidents.jsonl",
            Record::FixQueue => "fix_queue.jsonl",
            Record::Tasks => "tasks.jsonl",
            Record::ActiveTask => "active_task.json",
        }
    }

    /// Append-only line-delimited log.
    pub fn is_log(self) -> bool {
        matches!(self, Record::Incidents | Record::FixQueue | Record::Tasks)
    }
}

/// Callback for [`StateStore::modify`]: current contents in, replacement out
/// (`None` leaves the record untouched).
pub type Update<'a> = dyn FnMut(Option<&str>) -> Result<Option<String>> + 'a;

/// Callback for [`StateStore::append`]: current contents in, lines to append out.
pub type Lines<'a> = dyn FnMut(Option<&str>) -> Result<Vec<String>> + 'a;

pub trait StateStore {
    /// Current raw contents; `None` if the record was never written.
    fn read(&self, record: Record) -> Result<Option<String>>;

    /// Replace a record's contents based on its current contents, atomically
    /// with respect to every other writer of the same record.
    fn modify(&self, record: Record, update: &mut Update<'_>) -> Result<()>;

    /// Append whole lines to a log record. `build` runs under the same lock
    /// as the write so appends can be validated against the current log.
    fn append(&self, record: Record, build: &mut Lines<'_>) -> Result<()>;
}

fn encode_lines(existing: Option<&str>, lines: &[String]) -> Result<String> {
    let mut buf = String::new();
    // Isolate a torn final line left by an interrupted writer.
    if existing.is_some_and(|text| !text.is_empty() && !text.ends_with('\n')) {
        buf.push('\n');
    }
    for line in lines {
        if line.contains('\n') {
            bail!("log line contains a newline");
        }
        buf.push_str(line);
        buf.push('\n');
    }
    Ok(buf)
}

/// File-backed store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, record: Record) -> PathBuf {
        self.dir.join(record.file_name())
    }

    fn lock(&self, record: Record) -> Result<FileLock> {
        let lock_path = self.dir.join(format!("{}.lock", record.file_name()));
        FileLock::acquire(&lock_path, self.lock_timeout)
    }
}

impl StateStore for FileStore {
    fn read(&self, record: Record) -> Result<Option<String>> {
        let path = self.path(record);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    #[instrument(skip_all, fields(record = record.file_name()))]
    fn modify(&self, record: Record, update: &mut Update<'_>) -> Result<()> {
        let _lock = self.lock(record)?;
        let current = self.read(record)?;
        let Some(next) = update(current.as_deref())? else {
            trace!("record unchanged");
            return Ok(());
        };
        write_atomic(&self.path(record), &next)?;
        debug!(bytes = next.len(), "record written");
        Ok(())
    }

    #[instrument(skip_all, fields(record = record.file_name()))]
    fn append(&self, record: Record, build: &mut Lines<'_>) -> Result<()> {
        let _lock = self.lock(record)?;
        let current = self.read(record)?;
        let lines = build(current.as_deref())?;
        if lines.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(current.as_deref(), &lines)?;
        let path = self.path(record);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {} for append", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        debug!(lines = lines.len(), "log appended");
        Ok(())
    }
}

/// Atomically replace `path` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("invalid state path {}", path.display()))?;
    let tmp_path = parent.join(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// In-process store for tests and embedding. The lock scope is a mutex.
#[derive(Debug)]
pub struct MemoryStore {
    records: Mutex<HashMap<Record, String>>,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn lock(&self, record: Record) -> Result<MutexGuard<'_, HashMap<Record, String>>> {
        let start = Instant::now();
        loop {
            match self.records.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => bail!("memory store poisoned"),
                Err(TryLockError::WouldBlock) => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockTimeout {
                            lock: record.file_name().to_string(),
                            waited_ms: self.lock_timeout.as_millis() as u64,
                        }
                        .into());
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

impl StateStore for MemoryStore {
    fn read(&self, record: Record) -> Result<Option<String>> {
        Ok(self.lock(record)?.get(&record).cloned())
    }

    fn modify(&self, record: Record, update: &mut Update<'_>) -> Result<()> {
        let mut records = self.lock(record)?;
        if let Some(next) = update(records.get(&record).map(String::as_str))? {
            records.insert(record, next);
        }
        Ok(())
    }

    fn append(&self, record: Record, build: &mut Lines<'_>) -> Result<()> {
        let mut records = self.lock(record)?;
        let current = records.get(&record).cloned();
        let lines = build(current.as_deref())?;
        if lines.is_empty() {
            return Ok(());
        }
        let buf = encode_lines(current.as_deref(), &lines)?;
        records.entry(record).or_default().push_str(&buf);
        Ok(())
    }
}
