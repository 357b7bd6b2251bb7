//! Dedup ledger: durable record of message IDs already forwarded.
//!
//! One ledger per account. The backing file is append-only, one identifier
//! per line; the full set is replayed into memory on load. An identifier
//! only counts as seen once its line has been written and synced.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::LedgerError;

/// Point-in-time copy of a ledger's membership.
pub type SeenSet = HashSet<String>;

/// File-backed set of forwarded message identifiers.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    ids: Mutex<SeenSet>,
}

impl Ledger {
    /// Load the ledger at `path`, creating its directory if needed.
    ///
    /// A missing file is an empty ledger. Lines are trimmed and blank
    /// lines ignored; duplicate lines collapse into one entry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| LedgerError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let ids = match File::open(&path) {
            Ok(file) => read_ids(&path, file)?,
            Err(e) if e.kind() == ErrorKind::NotFound => SeenSet::new(),
            Err(source) => return Err(LedgerError::Read { path, source }),
        };

        Ok(Self {
            path,
            ids: Mutex::new(ids),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current seen-set.
    pub fn snapshot(&self) -> SeenSet {
        self.lock().clone()
    }

    /// Whether `id` has been recorded.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    /// Record `id` as forwarded.
    ///
    /// Idempotent: an already-present identifier is a no-op and touches no
    /// file. Otherwise the line is appended and synced first; the in-memory
    /// set only grows once the write succeeded, so a failed append leaves the
    /// message eligible for the next poll in this process too.
    pub fn mark_seen(&self, id: &str) -> Result<(), LedgerError> {
        let mut ids = self.lock();
        if ids.contains(id) {
            return Ok(());
        }

        self.append(id).map_err(|source| LedgerError::Append {
            path: self.path.clone(),
            source,
        })?;

        ids.insert(id.to_string());
        Ok(())
    }

    /// Number of recorded identifiers.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn append(&self, id: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(format!("{id}\n").as_bytes())?;
        file.flush()?;
        file.sync_data()
    }

    fn lock(&self) -> MutexGuard<'_, SeenSet> {
        // The set is only ever grown by whole inserts, so a poisoned guard
        // still holds a consistent value.
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_ids(path: &Path, file: File) -> Result<SeenSet, LedgerError> {
    let mut ids = SeenSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| LedgerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let id = line.trim();
        if !id.is_empty() {
            ids.insert(id.to_string());
        }
    }
    Ok(ids)
}
