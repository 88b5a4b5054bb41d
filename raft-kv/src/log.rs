//! Durable, line-oriented replicated log.
//!
//! One file per node, one line per entry: `<term> <key> <base64(value)>`.
//! Values are base64-encoded because they may hold arbitrary serialized
//! payloads (including spaces and newlines) while the file stays
//! line-oriented text.
//!
//! Every mutation writes the file first and only then touches the in-memory
//! vector, both under the same mutex, so disk and memory never diverge.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use crate::error::LogError;
use crate::types::{LogEntry, is_valid_key};

/// Append-mostly replicated log, mirrored in memory and on disk.
pub struct DurableLog {
    path: PathBuf,
    entries: Mutex<Vec<LogEntry>>,
}

impl DurableLog {
    /// Opens (or creates) `{dir}/{node_id}log.dat` and replays it into memory.
    pub fn open(dir: &Path, node_id: &str) -> Result<Self, LogError> {
        fs::create_dir_all(dir).map_err(|source| LogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{}log.dat", node_id.replace(' ', "-")));
        let entries = load(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded log");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True before the first append.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Entry at `index`, if present.
    pub fn get(&self, index: usize) -> Option<LogEntry> {
        self.lock().get(index).cloned()
    }

    /// Term of the entry at `index`, if present.
    pub fn term_at(&self, index: usize) -> Option<u64> {
        self.lock().get(index).map(|entry| entry.term)
    }

    /// Index of the newest entry; `None` for an empty log.
    pub fn last_index(&self) -> Option<usize> {
        self.lock().len().checked_sub(1)
    }

    /// Term of the last entry, 0 for an empty log.
    pub fn last_term(&self) -> u64 {
        self.lock().last().map_or(0, |entry| entry.term)
    }

    /// Returns up to `count` entries starting at `start`, clamped to the log.
    pub fn get_range(&self, start: usize, count: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let start = start.min(entries.len());
        let end = start.saturating_add(count).min(entries.len());
        entries[start..end].to_vec()
    }

    /// Appends one entry and returns its index.
    pub fn append(&self, entry: LogEntry) -> Result<usize, LogError> {
        let mut entries = self.lock();
        append_lines(&self.path, std::slice::from_ref(&entry))?;
        entries.push(entry);
        Ok(entries.len() - 1)
    }

    /// Appends every entry of `new_entries` with a single sync.
    pub fn append_range(&self, new_entries: &[LogEntry]) -> Result<(), LogError> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut entries = self.lock();
        append_lines(&self.path, new_entries)?;
        entries.extend_from_slice(new_entries);
        Ok(())
    }

    /// Removes `count` entries starting at `start`.
    ///
    /// Only used to discard a conflicting suffix, so the file is rewritten
    /// through a temporary copy rather than edited in place.
    pub fn remove_range(&self, start: usize, count: usize) -> Result<(), LogError> {
        let mut entries = self.lock();
        let end = start.saturating_add(count);
        if start > entries.len() || end > entries.len() {
            return Err(LogError::OutOfRange {
                start,
                end,
                len: entries.len(),
            });
        }
        if count == 0 {
            return Ok(());
        }

        let kept: Vec<LogEntry> = entries[..start]
            .iter()
            .chain(entries[end..].iter())
            .cloned()
            .collect();
        rewrite(&self.path, &kept)?;
        *entries = kept;
        Ok(())
    }

    /// Removes every entry from `start` onward.
    pub fn truncate_from(&self, start: usize) -> Result<(), LogError> {
        let len = self.len();
        if start >= len {
            return Ok(());
        }
        self.remove_range(start, len - start)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        // A panic while holding the guard cannot leave the vector half-written:
        // the file is always updated before the vector.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> LogError + '_ {
    move |source| LogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn encode_line(entry: &LogEntry) -> Result<String, LogError> {
    if !is_valid_key(&entry.key) {
        return Err(LogError::InvalidKey(entry.key.clone()));
    }
    Ok(format!(
        "{} {} {}\n",
        entry.term,
        entry.key,
        STANDARD.encode(entry.value.as_bytes())
    ))
}

fn decode_line(line_no: usize, line: &str) -> Result<LogEntry, LogError> {
    let corrupt = |reason: String| LogError::Corrupt {
        line: line_no,
        reason,
    };

    let mut parts = line.split(' ');
    let (Some(term), Some(key), Some(value), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(corrupt(format!("expected 3 fields in {line:?}")));
    };

    let term = term
        .parse::<u64>()
        .map_err(|err| corrupt(format!("bad term {term:?}: {err}")))?;
    let bytes = STANDARD
        .decode(value)
        .map_err(|err| corrupt(format!("bad base64 value: {err}")))?;
    let value = String::from_utf8(bytes).map_err(|err| corrupt(format!("value is not utf-8: {err}")))?;

    Ok(LogEntry::new(term, key, value))
}

fn load(path: &Path) -> Result<Vec<LogEntry>, LogError> {
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(io_error(path))?;

    let mut entries = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_error(path))?;
        if line.is_empty() {
            continue;
        }
        entries.push(decode_line(i + 1, &line)?);
    }
    Ok(entries)
}

fn append_lines(path: &Path, entries: &[LogEntry]) -> Result<(), LogError> {
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&encode_line(entry)?);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(io_error(path))?;
    file.write_all(buf.as_bytes()).map_err(io_error(path))?;
    file.sync_data().map_err(io_error(path))
}

fn rewrite(path: &Path, entries: &[LogEntry]) -> Result<(), LogError> {
    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&encode_line(entry)?);
    }

    let tmp = path.with_extension("dat.tmp");
    let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
    file.write_all(buf.as_bytes()).map_err(io_error(&tmp))?;
    file.sync_data().map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}
