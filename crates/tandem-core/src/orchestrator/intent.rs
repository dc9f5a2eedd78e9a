use super::metadata::MilestoneMetadata;
use crate::power::PowerSignalKind;
use crate::resilience::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// CommitKind / Trigger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    /// Automatic, after a burst of changes settles. Goes to the draft branch.
    Draft,
    /// User-authored with metadata. Goes to the working branch.
    Milestone,
    /// Forced by sleep or power-off. Goes to the draft branch.
    Emergency,
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommitKind::Draft => "draft",
            CommitKind::Milestone => "milestone",
            CommitKind::Emergency => "emergency",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Debounce,
    Manual,
    Power(PowerSignalKind),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Debounce => f.write_str("debounce"),
            Trigger::Manual => f.write_str("manual"),
            Trigger::Power(kind) => write!(f, "{kind}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CommitIntent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitIntent {
    pub repo: PathBuf,
    pub kind: CommitKind,
    pub target_branch: String,
    pub trigger: Trigger,
    /// Paths the burst touched, relative to `repo`. Informational: the
    /// commit captures the whole working tree.
    #[serde(default)]
    pub affected_paths: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<MilestoneMetadata>,
    /// Branch whose tree a milestone promotes onto `target_branch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_branch: Option<String>,
}

impl CommitIntent {
    pub fn draft(repo: PathBuf, draft_branch: &str, affected_paths: Vec<PathBuf>) -> Self {
        Self {
            repo,
            kind: CommitKind::Draft,
            target_branch: draft_branch.to_string(),
            trigger: Trigger::Debounce,
            affected_paths,
            milestone: None,
            source_branch: None,
        }
    }

    pub fn emergency(
        repo: PathBuf,
        draft_branch: &str,
        trigger: Trigger,
        affected_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            repo,
            kind: CommitKind::Emergency,
            target_branch: draft_branch.to_string(),
            trigger,
            affected_paths,
            milestone: None,
            source_branch: None,
        }
    }

    /// Promote the draft branch, with any edits not yet drafted, onto the
    /// working branch.
    pub fn milestone(
        repo: PathBuf,
        draft_branch: &str,
        working_branch: &str,
        metadata: MilestoneMetadata,
    ) -> Self {
        Self {
            repo,
            kind: CommitKind::Milestone,
            target_branch: working_branch.to_string(),
            trigger: Trigger::Manual,
            affected_paths: Vec::new(),
            milestone: Some(metadata),
            source_branch: Some(draft_branch.to_string()),
        }
    }

    pub fn message(&self) -> String {
        let n = self.affected_paths.len();
        let changed = format!("{n} path{} changed", if n == 1 { "" } else { "s" });
        match self.kind {
            CommitKind::Draft => format!("draft: {changed}"),
            CommitKind::Emergency => format!("emergency ({}): {changed}", self.trigger),
            CommitKind::Milestone => self
                .milestone
                .as_ref()
                .map(|m| m.message.clone())
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "milestone".to_string()),
        }
    }

    pub fn to_operation(&self) -> Operation {
        Operation::Commit {
            kind: self.kind,
            branch: self.target_branch.clone(),
            message: self.message(),
            metadata: self
                .milestone
                .as_ref()
                .map(MilestoneMetadata::to_pairs)
                .unwrap_or_default(),
            paths: self.affected_paths.clone(),
            source: self.source_branch.clone(),
        }
    }
}
