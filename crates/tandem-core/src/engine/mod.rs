//! The version-control engine seam.
//!
//! Storage and diff mechanics belong to the engine; this crate only drives
//! it. Calls are synchronous and may block on I/O, so async callers run them
//! under `spawn_blocking`.

pub mod cli;
pub mod memory;

pub use cli::CliEngine;
pub use memory::{EngineOp, MemoryEngine};

use crate::error::EngineError;
use crate::lock::LockRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Commit identifier as reported by the engine.
pub type CommitId = String;

// ---------------------------------------------------------------------------
// WorkingStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingStatus {
    pub staged: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub untracked: Vec<PathBuf>,
}

impl WorkingStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.modified.is_empty() && self.untracked.is_empty()
    }

    /// Every path that differs from the last commit, deduplicated and sorted.
    pub fn changed_paths(&self) -> Vec<PathBuf> {
        let mut all: Vec<PathBuf> = self
            .staged
            .iter()
            .chain(&self.modified)
            .chain(&self.untracked)
            .cloned()
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

// ---------------------------------------------------------------------------
// VcsEngine
// ---------------------------------------------------------------------------

pub trait VcsEngine: Send + Sync + Debug {
    fn init(&self, repo: &Path) -> EngineResult<()>;

    /// Switch to `branch`, creating it from the current head when `create`
    /// is set and it does not exist yet.
    fn checkout(&self, repo: &Path, branch: &str, create: bool) -> EngineResult<()>;

    fn stage(&self, repo: &Path, paths: &[PathBuf]) -> EngineResult<()>;

    fn commit(
        &self,
        repo: &Path,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<CommitId>;

    /// Record the committed tree of `from` as a new commit on `onto`,
    /// creating `onto` if needed. The working tree and the checked-out
    /// branch are left alone. Returns `None` when `onto` already holds that
    /// tree. `onto` must not be the checked-out branch.
    fn promote(
        &self,
        repo: &Path,
        from: &str,
        onto: &str,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<Option<CommitId>>;

    fn push(&self, repo: &Path, branch: &str) -> EngineResult<()>;

    fn status(&self, repo: &Path) -> EngineResult<WorkingStatus>;

    /// Publish the current lock (or its absence) where remote observers can
    /// poll it. Engines without such a channel accept and ignore it.
    fn publish_lock(&self, _repo: &Path, _record: Option<&LockRecord>) -> EngineResult<()> {
        Ok(())
    }
}

/// Render a commit message with `Key: value` trailer lines.
pub fn render_message(message: &str, metadata: &BTreeMap<String, String>) -> String {
    if metadata.is_empty() {
        return message.to_string();
    }
    let mut out = message.trim_end().to_string();
    out.push_str("\n\n");
    for (k, v) in metadata {
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_paths_dedups_across_sections() {
        let status = WorkingStatus {
            staged: vec!["b.wav".into()],
            modified: vec!["a.als".into(), "b.wav".into()],
            untracked: vec![],
        };
        assert!(!status.is_clean());
        assert_eq!(
            status.changed_paths(),
            vec![PathBuf::from("a.als"), PathBuf::from("b.wav")]
        );
        assert!(WorkingStatus::default().is_clean());
    }

    #[test]
    fn render_message_appends_trailers() {
        let mut meta = BTreeMap::new();
        meta.insert("BPM".to_string(), "128".to_string());
        meta.insert("Key".to_string(), "A minor".to_string());
        assert_eq!(
            render_message("Final mix\n", &meta),
            "Final mix\n\nBPM: 128\nKey: A minor\n"
        );
        assert_eq!(render_message("plain", &BTreeMap::new()), "plain");
    }
}
