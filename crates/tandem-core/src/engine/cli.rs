//! Engine backed by a git-compatible command-line VCS (`oxen`, `git`).
//!
//! Each call spawns the program in the repository directory. Failures are
//! classified from stderr into the engine error taxonomy so the resilience
//! layer can tell transient faults from fatal ones.

use super::{render_message, CommitId, EngineResult, VcsEngine, WorkingStatus};
use crate::error::{EngineError, EngineErrorKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct CliEngine {
    program: PathBuf,
    remote: String,
}

impl CliEngine {
    /// Resolve `program` on `PATH`.
    pub fn locate(program: &str, remote: &str) -> EngineResult<Self> {
        let program = which::which(program).map_err(|e| {
            EngineError::new(
                EngineErrorKind::NotFound,
                format!("'{program}' not found on PATH: {e}"),
            )
        })?;
        Ok(Self::new(program, remote))
    }

    pub fn new(program: impl Into<PathBuf>, remote: &str) -> Self {
        Self {
            program: program.into(),
            remote: remote.to_string(),
        }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> EngineResult<Output> {
        tracing::debug!(program = %self.program.display(), ?args, "engine call");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(repo)
            .output()
            .map_err(|e| {
                EngineError::new(
                    EngineErrorKind::Other,
                    format!("failed to spawn {}: {e}", self.program.display()),
                )
            })?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(EngineError::new(classify(&text), text))
        }
    }

    fn rev_parse(&self, repo: &Path, rev: &str) -> EngineResult<String> {
        let out = self.run(repo, &["rev-parse", rev])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Commit id of a local branch, `None` if it does not exist.
    fn branch_tip(&self, repo: &Path, branch: &str) -> EngineResult<Option<String>> {
        let refname = format!("refs/heads/{branch}");
        match self.run(repo, &["rev-parse", "--verify", "--quiet", &refname]) {
            Ok(out) => Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string())),
            // --quiet exits non-zero with no output for a missing ref.
            Err(e) if e.message.is_empty() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl VcsEngine for CliEngine {
    fn init(&self, repo: &Path) -> EngineResult<()> {
        self.run(repo, &["init"]).map(|_| ())
    }

    fn checkout(&self, repo: &Path, branch: &str, create: bool) -> EngineResult<()> {
        match self.run(repo, &["checkout", branch]) {
            Err(e) if create && e.kind == EngineErrorKind::NotFound => {
                self.run(repo, &["checkout", "-b", branch]).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    fn stage(&self, repo: &Path, paths: &[PathBuf]) -> EngineResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["add", "-A", "--"];
        let owned: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
        args.extend(owned.iter().map(String::as_str));
        self.run(repo, &args).map(|_| ())
    }

    fn commit(
        &self,
        repo: &Path,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<CommitId> {
        let full = render_message(message, metadata);
        self.run(repo, &["commit", "-m", &full])?;
        let head = self.run(repo, &["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&head.stdout).trim().to_string())
    }

    fn promote(
        &self,
        repo: &Path,
        from: &str,
        onto: &str,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<Option<CommitId>> {
        let source = self.rev_parse(repo, from)?;
        let tree = self.rev_parse(repo, &format!("{source}^{{tree}}"))?;
        let parent = self.branch_tip(repo, onto)?;
        if let Some(parent) = &parent {
            if self.rev_parse(repo, &format!("{parent}^{{tree}}"))? == tree {
                return Ok(None);
            }
        }

        // Plumbing only, so the checked-out branch and files stay put. The
        // source tip is a second parent to keep draft history reachable.
        let full = render_message(message, metadata);
        let mut args: Vec<&str> = vec!["commit-tree", tree.as_str()];
        if let Some(parent) = &parent {
            args.extend(["-p", parent.as_str()]);
        }
        args.extend(["-p", source.as_str(), "-m", full.as_str()]);
        let out = self.run(repo, &args)?;
        let commit = String::from_utf8_lossy(&out.stdout).trim().to_string();

        // An empty old value makes update-ref refuse if the branch appeared
        // in the meantime.
        let refname = format!("refs/heads/{onto}");
        let old = parent.as_deref().unwrap_or("");
        self.run(repo, &["update-ref", &refname, &commit, old])?;
        Ok(Some(commit))
    }

    fn push(&self, repo: &Path, branch: &str) -> EngineResult<()> {
        self.run(repo, &["push", &self.remote, branch]).map(|_| ())
    }

    fn status(&self, repo: &Path) -> EngineResult<WorkingStatus> {
        let out = self.run(repo, &["status", "--porcelain"])?;
        Ok(parse_porcelain(&String::from_utf8_lossy(&out.stdout)))
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `status --porcelain` (v1) output.
pub fn parse_porcelain(text: &str) -> WorkingStatus {
    let mut status = WorkingStatus::default();
    for line in text.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(2);
        let path = rest.trim_start();
        // Renames report "old -> new"; the new path is what changed.
        let path = PathBuf::from(path.rsplit(" -> ").next().unwrap_or(path).trim_matches('"'));
        let mut chars = code.chars();
        let (x, y) = (chars.next().unwrap_or(' '), chars.next().unwrap_or(' '));
        if x == '?' && y == '?' {
            status.untracked.push(path);
            continue;
        }
        if x != ' ' {
            status.staged.push(path.clone());
        }
        if y != ' ' {
            status.modified.push(path);
        }
    }
    status
}

struct Classifier {
    kind: EngineErrorKind,
    re: Regex,
}

static CLASSIFIERS: OnceLock<Vec<Classifier>> = OnceLock::new();

fn classifiers() -> &'static [Classifier] {
    CLASSIFIERS.get_or_init(|| {
        [
            (
                EngineErrorKind::Auth,
                r"(?i)authentication failed|permission denied|unauthori[sz]ed|403 forbidden|invalid (api )?token",
            ),
            (
                EngineErrorKind::Corrupt,
                r"(?i)corrupt|bad object|object file .* is empty|fatal: loose object",
            ),
            (
                EngineErrorKind::Conflict,
                r"(?i)\[rejected\]|non-fast-forward|conflict|fetch first",
            ),
            (
                EngineErrorKind::Timeout,
                r"(?i)timed out|timeout|deadline exceeded",
            ),
            (
                EngineErrorKind::Network,
                r"(?i)could not resolve host|connection (reset|refused)|network is unreachable|broken pipe|unable to access|temporary failure in name resolution",
            ),
            (
                EngineErrorKind::NotFound,
                r"(?i)did not match any|not found|does not exist|not a (git |oxen )?repository|unknown revision",
            ),
        ]
        .into_iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| Classifier { kind, re }))
        .collect()
    })
}

/// Map engine output to an error class. Unrecognised output is `Other`.
pub fn classify(text: &str) -> EngineErrorKind {
    classifiers()
        .iter()
        .find(|c| c.re.is_match(text))
        .map(|c| c.kind)
        .unwrap_or(EngineErrorKind::Other)
}
