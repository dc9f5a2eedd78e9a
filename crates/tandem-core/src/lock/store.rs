//! Persisted lock record with compare-and-swap.
//!
//! The record lives in `.tandem/lock.json`. Every read-compare-write runs
//! while holding an exclusive `fs2` lock on `.tandem/lock.guard`, so
//! concurrent callers in different processes (GUI, daemon, CLI) serialize on
//! the file and never blindly overwrite each other.

use super::record::LockRecord;
use crate::error::{Result, TandemError};
use crate::io;
use crate::paths;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// CasOutcome / Displaced
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The persisted record did not match the expected token.
    Conflict { current: Option<LockRecord> },
}

/// What a force clear removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Displaced {
    None,
    Record(LockRecord),
    /// The file existed but could not be parsed.
    Unreadable(String),
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

pub trait LockStore: Send + Sync + Debug {
    fn load(&self) -> Result<Option<LockRecord>>;

    /// Replace the record only if its current token equals `expected`
    /// (`None` meaning "no record"). `new = None` deletes the record.
    fn compare_and_swap(
        &self,
        expected: Option<&str>,
        new: Option<&LockRecord>,
    ) -> Result<CasOutcome>;

    /// Delete whatever is there, unconditionally. `before_delete` runs inside
    /// the critical section with the displaced value; if it fails, nothing is
    /// deleted.
    fn force_clear(
        &self,
        before_delete: &mut dyn FnMut(&Displaced) -> Result<()>,
    ) -> Result<Displaced>;
}

// ---------------------------------------------------------------------------
// FileLockStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileLockStore {
    path: PathBuf,
    guard: PathBuf,
}

impl FileLockStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: paths::lock_path(root),
            guard: paths::lock_guard_path(root),
        }
    }

    fn read_raw(&self) -> Result<Option<String>> {
        io::read_optional(&self.path)
    }

    fn parse(&self, data: &str) -> Result<LockRecord> {
        serde_json::from_str(data).map_err(|e| TandemError::CorruptRecord {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn read(&self) -> Result<Option<LockRecord>> {
        match self.read_raw()? {
            None => Ok(None),
            Some(data) if data.trim().is_empty() => Ok(None),
            Some(data) => self.parse(&data).map(Some),
        }
    }

    fn write(&self, new: Option<&LockRecord>) -> Result<()> {
        match new {
            Some(record) => {
                let data = serde_json::to_vec_pretty(record)?;
                io::atomic_write(&self.path, &data)
            }
            None => match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

impl LockStore for FileLockStore {
    fn load(&self) -> Result<Option<LockRecord>> {
        io::with_exclusive(&self.guard, || self.read())
    }

    fn compare_and_swap(
        &self,
        expected: Option<&str>,
        new: Option<&LockRecord>,
    ) -> Result<CasOutcome> {
        io::with_exclusive(&self.guard, || {
            let current = self.read()?;
            let current_id = current.as_ref().map(|r| r.lock_id.as_str());
            if current_id != expected {
                return Ok(CasOutcome::Conflict { current });
            }
            self.write(new)?;
            Ok(CasOutcome::Swapped)
        })
    }

    fn force_clear(
        &self,
        before_delete: &mut dyn FnMut(&Displaced) -> Result<()>,
    ) -> Result<Displaced> {
        io::with_exclusive(&self.guard, || {
            let displaced = match self.read_raw()? {
                None => Displaced::None,
                Some(data) if data.trim().is_empty() => Displaced::None,
                Some(data) => match self.parse(&data) {
                    Ok(record) => Displaced::Record(record),
                    Err(e) => Displaced::Unreadable(e.to_string()),
                },
            };
            before_delete(&displaced)?;
            self.write(None)?;
            Ok(displaced)
        })
    }
}
