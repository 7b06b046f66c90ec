//! Changelog backends.
//!
//! A [`Changelog`] is the append-only log behind a
//! [`ChangelogStateStore`](super::ChangelogStateStore). [`MemoryChangelog`]
//! keeps entries in a vector; [`FileChangelog`] writes one JSON document per
//! line and survives process restarts.

use super::{ChangelogEntry, StateError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Append-only storage for [`ChangelogEntry`] records.
pub trait Changelog: Send + Sync {
    /// Appends one entry. On error the log is left as it was before the call.
    fn append(&self, entry: &ChangelogEntry) -> Result<(), StateError>;

    /// Reads every entry in append order.
    fn read_all(&self) -> Result<Vec<ChangelogEntry>, StateError>;

    /// Atomically replaces the whole log with `entries`.
    fn rewrite(&self, entries: &[ChangelogEntry]) -> Result<(), StateError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory changelog. State does not survive the process.
#[derive(Debug, Default)]
pub struct MemoryChangelog {
    entries: Mutex<Vec<ChangelogEntry>>,
}

impl MemoryChangelog {
    /// Creates an empty in-memory changelog.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Changelog for MemoryChangelog {
    fn append(&self, entry: &ChangelogEntry) -> Result<(), StateError> {
        lock(&self.entries).push(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<ChangelogEntry>, StateError> {
        Ok(lock(&self.entries).clone())
    }

    fn rewrite(&self, entries: &[ChangelogEntry]) -> Result<(), StateError> {
        *lock(&self.entries) = entries.to_vec();
        Ok(())
    }
}

/// File-backed changelog.
///
/// Entries are stored as JSON lines in a single file. A crash in the middle of
/// an append can leave a trailing line without its newline; [`FileChangelog::open`]
/// truncates such a torn tail before accepting new writes. Compaction writes a
/// sibling `.compact` file and renames it over the log.
#[derive(Debug)]
pub struct FileChangelog {
    path: PathBuf,
    sync_on_write: bool,
    file: Mutex<File>,
}

impl FileChangelog {
    /// Opens (or creates) the changelog at `path`.
    ///
    /// With `sync_on_write`, every append is flushed to stable storage before
    /// returning.
    pub fn open<P: AsRef<Path>>(path: P, sync_on_write: bool) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        truncate_torn_tail(&path)?;
        let file = open_append(&path)?;
        Ok(Self {
            path,
            sync_on_write,
            file: Mutex::new(file),
        })
    }

    /// Returns the path of the changelog file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(&self) -> PathBuf {
        self.path.with_extension("compact")
    }
}

fn open_append(path: &Path) -> Result<File, StateError> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn truncate_torn_tail(path: &Path) -> Result<(), StateError> {
    if !path.exists() {
        return Ok(());
    }
    let data = fs::read(path)?;
    if data.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }
    let keep = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = data.len() - keep,
        "truncating torn changelog tail"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

fn encode(entry: &ChangelogEntry) -> Result<String, StateError> {
    let mut line =
        serde_json::to_string(entry).map_err(|e| StateError::Serialization(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

impl Changelog for FileChangelog {
    fn append(&self, entry: &ChangelogEntry) -> Result<(), StateError> {
        let line = encode(entry)?;
        let mut file = lock(&self.file);
        let len_before = file.metadata()?.len();
        let written = file.write_all(line.as_bytes()).and_then(|()| {
            if self.sync_on_write {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            // Roll back a partial line so later appends start on a clean boundary.
            if let Err(rollback) = file.set_len(len_before) {
                warn!(error = %rollback, "failed to roll back partial changelog append");
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<ChangelogEntry>, StateError> {
        let _guard = lock(&self.file);
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| StateError::Corrupt {
                line: idx + 1,
                reason: e.to_string(),
            })?;
            entries.push(entry);
        }
        debug!(path = %self.path.display(), entries = entries.len(), "read changelog");
        Ok(entries)
    }

    fn rewrite(&self, entries: &[ChangelogEntry]) -> Result<(), StateError> {
        let mut file = lock(&self.file);
        let tmp = self.compact_path();
        {
            let mut out = File::create(&tmp)?;
            for entry in entries {
                out.write_all(encode(entry)?.as_bytes())?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *file = open_append(&self.path)?;
        Ok(())
    }
}
