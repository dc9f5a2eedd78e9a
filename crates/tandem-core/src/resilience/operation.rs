use crate::engine::{CommitId, EngineResult, VcsEngine};
use crate::error::{EngineError, EngineErrorKind};
use crate::lock::LockRecord;
use crate::orchestrator::CommitKind;
use crate::{io, paths};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// One unit of work against the engine. Serializable so it can sit in the
/// offline queue across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Commit {
        kind: CommitKind,
        branch: String,
        message: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
        #[serde(default)]
        paths: Vec<PathBuf>,
        /// Branch whose tree is promoted onto `branch`. The working tree is
        /// snapshotted onto `source` first and stays checked out there.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Push {
        branch: String,
    },
    MirrorLock {
        record: Option<LockRecord>,
    },
}

impl Operation {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            Operation::Commit { .. } => Endpoint::Engine,
            Operation::Push { .. } | Operation::MirrorLock { .. } => Endpoint::Remote,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Operation::Commit {
                kind,
                branch,
                source: Some(source),
                ..
            } if source != branch => format!("{kind} commit {source} -> {branch}"),
            Operation::Commit { kind, branch, .. } => format!("{kind} commit to {branch}"),
            Operation::Push { branch } => format!("push {branch}"),
            Operation::MirrorLock { record: Some(r) } => format!("mirror lock held by {}", r.holder),
            Operation::MirrorLock { record: None } => "mirror lock released".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint / OpOutcome
// ---------------------------------------------------------------------------

/// Which dependency a call talks to; each gets its own circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// The local engine process (commits).
    Engine,
    /// The collaboration remote (push, lock mirror).
    Remote,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Endpoint::Engine => "engine",
            Endpoint::Remote => "remote",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OpOutcome {
    Committed { commit_id: CommitId },
    /// The working tree matched the last commit. Counts as success.
    NothingToCommit,
    Pushed,
    Mirrored,
}

// ---------------------------------------------------------------------------
// OperationExecutor
// ---------------------------------------------------------------------------

pub trait OperationExecutor: Send + Sync + Debug {
    fn execute(&self, repo: &Path, op: &Operation) -> EngineResult<OpOutcome>;
}

/// Runs operations against a `VcsEngine`.
///
/// Each operation holds the repository's engine guard for its whole
/// checkout-status-stage-commit sequence, so sequences started by different
/// tasks or processes never interleave on one working tree.
#[derive(Debug, Clone)]
pub struct EngineExecutor {
    engine: Arc<dyn VcsEngine>,
}

impl EngineExecutor {
    pub fn new(engine: Arc<dyn VcsEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn VcsEngine> {
        &self.engine
    }

    /// Commit the whole working tree onto `branch`. `None` if it was clean.
    fn snapshot(
        &self,
        repo: &Path,
        branch: &str,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<Option<CommitId>> {
        self.engine.checkout(repo, branch, true)?;
        // Re-checking status on every attempt makes a retry after a commit
        // that landed report NothingToCommit, not a duplicate.
        let status = self.engine.status(repo)?;
        if status.is_clean() {
            return Ok(None);
        }
        self.engine.stage(repo, &status.changed_paths())?;
        self.engine.commit(repo, message, metadata).map(Some)
    }

    fn run(&self, repo: &Path, op: &Operation) -> EngineResult<OpOutcome> {
        match op {
            Operation::Commit {
                branch,
                message,
                metadata,
                source,
                ..
            } => {
                let committed = match source.as_deref().filter(|s| *s != branch.as_str()) {
                    Some(source) => {
                        self.snapshot(repo, source, message, metadata)?;
                        self.engine.promote(repo, source, branch, message, metadata)?
                    }
                    None => self.snapshot(repo, branch, message, metadata)?,
                };
                Ok(match committed {
                    Some(commit_id) => OpOutcome::Committed { commit_id },
                    None => OpOutcome::NothingToCommit,
                })
            }
            Operation::Push { branch } => {
                self.engine.push(repo, branch)?;
                Ok(OpOutcome::Pushed)
            }
            Operation::MirrorLock { record } => {
                self.engine.publish_lock(repo, record.as_ref())?;
                Ok(OpOutcome::Mirrored)
            }
        }
    }
}

impl OperationExecutor for EngineExecutor {
    fn execute(&self, repo: &Path, op: &Operation) -> EngineResult<OpOutcome> {
        let guard = paths::engine_guard_path(repo);
        io::with_exclusive(&guard, || Ok(self.run(repo, op))).map_err(|e| {
            EngineError::new(
                EngineErrorKind::Other,
                format!("engine guard {}: {e}", guard.display()),
            )
        })?
    }
}
