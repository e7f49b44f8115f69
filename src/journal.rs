//! Journals
//!
//! Every committed maintenance batch is handed to the view store's [Journal]
//! before it becomes visible. A batch the journal rejects is never applied,
//! so a view never runs ahead of its journal

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use concord_core::{Key, ViewName};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One key write of a committed batch, with the value already encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub key: Key,
    pub value: Option<serde_json::Value>,
}

pub trait Journal: Send + Sync {
    /// Durably records one batch. Called with the view's lock held
    fn append(&self, view: &ViewName, batch: &[JournalRecord]) -> Result<(), StoreError>;

    /// Forgets everything recorded for `view`
    fn truncate(&self, view: &ViewName) -> Result<(), StoreError>;

    /// Every batch recorded for `view`, oldest first
    fn restore(&self, view: &ViewName) -> Result<Vec<Vec<JournalRecord>>, StoreError>;

    /// Replaces everything recorded for `view` with the single batch
    /// `snapshot`, which must reproduce the view on its own
    fn compact(&self, _view: &ViewName, _snapshot: &[JournalRecord]) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Keeps views in memory only. Counts what it is given
#[derive(Debug, Default)]
pub struct MemoryJournal {
    batches: AtomicUsize,
    records: AtomicUsize,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> usize {
        self.records.load(Ordering::SeqCst)
    }
}

impl Journal for MemoryJournal {
    fn append(&self, _view: &ViewName, batch: &[JournalRecord]) -> Result<(), StoreError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.records.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(())
    }

    fn truncate(&self, _view: &ViewName) -> Result<(), StoreError> {
        Ok(())
    }

    fn restore(&self, _view: &ViewName) -> Result<Vec<Vec<JournalRecord>>, StoreError> {
        Ok(Vec::new())
    }
}

/// Appends one JSON line per batch to `<dir>/<view>.jsonl`
///
/// A torn final line (a crash mid append) is cut off the file on restore;
/// that batch was never acknowledged so it was never visible either. Each
/// view's file has its own lock, so views never wait on each other's syncs
#[derive(Debug)]
pub struct FileJournal {
    dir: PathBuf,
    files: DashMap<ViewName, Arc<Mutex<File>>>,
}

impl FileJournal {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| StoreError::Unavailable(format!("{}: {}", dir.display(), err)))?;
        Ok(FileJournal {
            dir,
            files: DashMap::new(),
        })
    }

    pub fn path_of(&self, view: &ViewName) -> PathBuf {
        let file_name: String = view
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.jsonl", file_name))
    }

    fn journal_error(view: &ViewName, err: impl ToString) -> StoreError {
        StoreError::Journal {
            view: view.clone(),
            reason: err.to_string(),
        }
    }

    fn file(&self, view: &ViewName) -> Result<Arc<Mutex<File>>, StoreError> {
        let file = self.files.entry(view.clone()).or_try_insert_with(|| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_of(view))
                .map(|file| Arc::new(Mutex::new(file)))
                .map_err(|err| Self::journal_error(view, err))
        })?;
        Ok(file.value().clone())
    }

    /// Cuts the file back to its first `len` bytes, terminating the last
    /// intact line when the crash came before its newline
    fn repair(&self, view: &ViewName, len: u64, terminate: bool) -> Result<(), StoreError> {
        self.files.remove(view);
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path_of(view))
            .map_err(|err| Self::journal_error(view, err))?;
        file.set_len(len)
            .and_then(|_| if terminate { file.write_all(b"\n") } else { Ok(()) })
            .and_then(|_| file.sync_data())
            .map_err(|err| Self::journal_error(view, err))
    }
}

impl Journal for FileJournal {
    fn append(&self, view: &ViewName, batch: &[JournalRecord]) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(batch).map_err(|err| Self::journal_error(view, err))?;
        line.push('\n');

        let file = self.file(view)?;
        let mut file = file.lock()?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|err| Self::journal_error(view, err))
    }

    fn truncate(&self, view: &ViewName) -> Result<(), StoreError> {
        self.files.remove(view);
        File::create(self.path_of(view))
            .and_then(|file| file.sync_data())
            .map_err(|err| Self::journal_error(view, err))
    }

    fn restore(&self, view: &ViewName) -> Result<Vec<Vec<JournalRecord>>, StoreError> {
        let bytes = match fs::read(self.path_of(view)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::journal_error(view, err)),
        };

        let mut batches = Vec::new();
        // end of the last intact line, newline included when present
        let mut intact = 0;
        let mut start = 0;
        let mut number = 0;
        while start < bytes.len() {
            number += 1;
            let (line, next) = match bytes[start..].iter().position(|b| *b == b'\n') {
                Some(n) => (&bytes[start..start + n], start + n + 1),
                None => (&bytes[start..], bytes.len()),
            };

            if line.iter().all(u8::is_ascii_whitespace) {
                intact = next;
            } else {
                match serde_json::from_slice::<Vec<JournalRecord>>(line) {
                    Ok(batch) => {
                        batches.push(batch);
                        intact = next;
                    }
                    Err(err) if next == bytes.len() => {
                        tracing::warn!(view = %view, line = number, error = %err, "cutting torn journal tail");
                    }
                    Err(err) => return Err(Self::journal_error(view, format!("line {}: {}", number, err))),
                }
            }
            start = next;
        }

        let terminate = intact > 0 && bytes[intact - 1] != b'\n';
        if intact < bytes.len() || terminate {
            self.repair(view, intact as u64, terminate)?;
        }
        Ok(batches)
    }

    /// Writes the snapshot beside the journal and renames it into place
    fn compact(&self, view: &ViewName, snapshot: &[JournalRecord]) -> Result<(), StoreError> {
        let path = self.path_of(view);
        let tmp = path.with_extension("jsonl.tmp");

        let mut contents = Vec::new();
        if !snapshot.is_empty() {
            serde_json::to_writer(&mut contents, snapshot).map_err(|err| Self::journal_error(view, err))?;
            contents.push(b'\n');
        }

        self.files.remove(view);
        File::create(&tmp)
            .and_then(|mut file| file.write_all(&contents).and_then(|_| file.sync_data()))
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|err| Self::journal_error(view, err))
    }
}
