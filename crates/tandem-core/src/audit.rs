//! Append-only audit log.
//!
//! One JSON object per line in `.tandem/audit.jsonl`. Entries are never
//! rewritten or deleted. Each append is synced before returning so a
//! transition is never reported as done without its entry on disk.

use crate::error::Result;
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// AuditOperation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Acquire,
    /// An expired lock taken over by a new holder without a force break.
    Reclaimed,
    Release,
    Renew,
    ForceBreak,
    DraftCommit,
    MilestoneCommit,
    EmergencyCommit,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditOperation::Acquire => "acquire",
            AuditOperation::Reclaimed => "reclaimed",
            AuditOperation::Release => "release",
            AuditOperation::Renew => "renew",
            AuditOperation::ForceBreak => "force_break",
            AuditOperation::DraftCommit => "draft_commit",
            AuditOperation::MilestoneCommit => "milestone_commit",
            AuditOperation::EmergencyCommit => "emergency_commit",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "acquire" => Ok(AuditOperation::Acquire),
            "reclaimed" => Ok(AuditOperation::Reclaimed),
            "release" => Ok(AuditOperation::Release),
            "renew" => Ok(AuditOperation::Renew),
            "force_break" => Ok(AuditOperation::ForceBreak),
            "draft_commit" => Ok(AuditOperation::DraftCommit),
            "milestone_commit" => Ok(AuditOperation::MilestoneCommit),
            "emergency_commit" => Ok(AuditOperation::EmergencyCommit),
            other => Err(format!("unknown audit operation: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: AuditOperation,
    pub actor: String,
    pub repository: PathBuf,
    pub success: bool,
    pub details: String,
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuditLog {
    repository: PathBuf,
    path: PathBuf,
}

impl AuditLog {
    pub fn new(root: &Path) -> Self {
        Self {
            repository: root.to_path_buf(),
            path: paths::audit_path(root),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry stamped with `at`.
    pub fn record(
        &self,
        at: DateTime<Utc>,
        operation: AuditOperation,
        actor: &str,
        success: bool,
        details: impl Into<String>,
    ) -> Result<AuditEntry> {
        let entry = AuditEntry {
            timestamp: at,
            operation,
            actor: actor.to_string(),
            repository: self.repository.clone(),
            success,
            details: details.into(),
        };
        self.append(&entry)?;
        Ok(entry)
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        io::append_line_synced(&self.path, &line)?;
        tracing::debug!(
            repo = %self.repository.display(),
            operation = %entry.operation,
            actor = %entry.actor,
            success = entry.success,
            "audit entry appended"
        );
        Ok(())
    }

    /// All readable entries in append order. A line that fails to parse
    /// (a crash mid-append leaves a torn tail) is skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let Some(data) = io::read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable audit line"
                ),
            }
        }
        Ok(entries)
    }

    /// The last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let mut all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }

    pub fn filter(&self, operation: AuditOperation) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.operation == operation)
            .collect())
    }
}
