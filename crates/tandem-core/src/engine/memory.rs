//! In-process engine for tests and dry runs, with scripted fault injection.

use super::{CommitId, EngineResult, VcsEngine, WorkingStatus};
use crate::error::{EngineError, EngineErrorKind};
use crate::lock::LockRecord;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Init,
    Checkout,
    Stage,
    Commit,
    Promote,
    Push,
    Status,
    PublishLock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryCommit {
    pub id: CommitId,
    pub branch: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub paths: Vec<PathBuf>,
}

/// Content version of each path.
type Tree = BTreeMap<PathBuf, u64>;

#[derive(Debug, Default)]
struct RepoState {
    branch: String,
    /// Committed tree of each branch.
    heads: BTreeMap<String, Tree>,
    working: Tree,
    staged: BTreeSet<PathBuf>,
    /// Last content version handed out by `touch`.
    version: u64,
    mirrored: Option<Option<LockRecord>>,
}

impl RepoState {
    fn head(&self) -> Tree {
        self.heads.get(&self.branch).cloned().unwrap_or_default()
    }

    fn is_dirty(&self, head: &Tree, path: &Path) -> bool {
        self.staged.contains(path) || head.get(path) != self.working.get(path)
    }
}

#[derive(Debug, Default)]
struct State {
    repos: BTreeMap<PathBuf, RepoState>,
    commits: Vec<MemoryCommit>,
    pushes: Vec<(PathBuf, String)>,
    faults: HashMap<EngineOp, VecDeque<EngineError>>,
    latency: HashMap<EngineOp, Duration>,
    calls: HashMap<EngineOp, u32>,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Test controls
    // -----------------------------------------------------------------------

    /// Modify a file in the working tree.
    pub fn touch(&self, repo: &Path, path: impl Into<PathBuf>) {
        let mut state = self.state();
        let repo = state.repos.entry(repo.to_path_buf()).or_default();
        repo.version += 1;
        let version = repo.version;
        repo.working.insert(path.into(), version);
    }

    /// Fail the next call of `op` with `err`. Queued faults fire in order.
    pub fn fail_next(&self, op: EngineOp, err: EngineError) {
        self.fail_times(op, err, 1);
    }

    pub fn fail_times(&self, op: EngineOp, err: EngineError, times: usize) {
        let mut state = self.state();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Block every call of `op` for `delay` before it runs.
    pub fn set_latency(&self, op: EngineOp, delay: Duration) {
        self.state().latency.insert(op, delay);
    }

    pub fn calls(&self, op: EngineOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn commits(&self) -> Vec<MemoryCommit> {
        self.state().commits.clone()
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.state().pushes.clone()
    }

    pub fn current_branch(&self, repo: &Path) -> Option<String> {
        self.state().repos.get(repo).map(|r| r.branch.clone())
    }

    /// Paths committed on `branch`, or `None` if the branch does not exist.
    pub fn branch_paths(&self, repo: &Path, branch: &str) -> Option<Vec<PathBuf>> {
        self.state()
            .repos
            .get(repo)
            .and_then(|r| r.heads.get(branch))
            .map(|tree| tree.keys().cloned().collect())
    }

    /// Whether `a` and `b` hold the same committed tree.
    pub fn same_tree(&self, repo: &Path, a: &str, b: &str) -> bool {
        let state = self.state();
        let Some(r) = state.repos.get(repo) else {
            return false;
        };
        matches!((r.heads.get(a), r.heads.get(b)), (Some(x), Some(y)) if x == y)
    }

    /// Last lock published for `repo`: `None` if never published,
    /// `Some(None)` if the published state is "unlocked".
    pub fn mirrored_lock(&self, repo: &Path) -> Option<Option<LockRecord>> {
        self.state().repos.get(repo).and_then(|r| r.mirrored.clone())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Count the call, apply latency, and pop a scripted fault if any.
    fn enter(&self, op: EngineOp) -> EngineResult<()> {
        let delay = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency.get(&op).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        match self.state().faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_repo<T>(
        &self,
        repo: &Path,
        f: impl FnOnce(&mut RepoState, &mut u64) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut state = self.state();
        let State { repos, seq, .. } = &mut *state;
        match repos.get_mut(repo) {
            Some(r) if !r.branch.is_empty() => f(r, seq),
            _ => Err(EngineError::new(
                EngineErrorKind::NotFound,
                format!("not a repository: {}", repo.display()),
            )),
        }
    }
}

impl VcsEngine for MemoryEngine {
    fn init(&self, repo: &Path) -> EngineResult<()> {
        self.enter(EngineOp::Init)?;
        let mut state = self.state();
        let r = state.repos.entry(repo.to_path_buf()).or_default();
        if r.branch.is_empty() {
            r.branch = "main".to_string();
            r.heads.insert("main".to_string(), Tree::new());
        }
        Ok(())
    }

    fn checkout(&self, repo: &Path, branch: &str, create: bool) -> EngineResult<()> {
        self.enter(EngineOp::Checkout)?;
        self.with_repo(repo, |r, _| {
            let current = r.head();
            if !r.heads.contains_key(branch) {
                if !create {
                    return Err(EngineError::new(
                        EngineErrorKind::NotFound,
                        format!("branch '{branch}' does not exist"),
                    ));
                }
                r.heads.insert(branch.to_string(), current.clone());
            }
            let target = r.heads.get(branch).cloned().unwrap_or_default();
            // Clean paths take the target's content; local edits carry over.
            let mut working = target;
            for (path, version) in &r.working {
                if r.is_dirty(&current, path) {
                    working.insert(path.clone(), *version);
                }
            }
            r.working = working;
            r.branch = branch.to_string();
            Ok(())
        })
    }

    fn stage(&self, repo: &Path, paths: &[PathBuf]) -> EngineResult<()> {
        self.enter(EngineOp::Stage)?;
        self.with_repo(repo, |r, _| {
            for p in paths {
                if !r.working.contains_key(p) {
                    return Err(EngineError::new(
                        EngineErrorKind::NotFound,
                        format!("pathspec '{}' did not match any files", p.display()),
                    ));
                }
                r.staged.insert(p.clone());
            }
            Ok(())
        })
    }

    fn commit(
        &self,
        repo: &Path,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<CommitId> {
        self.enter(EngineOp::Commit)?;
        let commit = self.with_repo(repo, |r, seq| {
            if r.staged.is_empty() {
                return Err(EngineError::new(
                    EngineErrorKind::Other,
                    "nothing to commit, working tree clean",
                ));
            }
            let paths: Vec<PathBuf> = std::mem::take(&mut r.staged).into_iter().collect();
            let head = r.heads.entry(r.branch.clone()).or_default();
            for p in &paths {
                if let Some(v) = r.working.get(p) {
                    head.insert(p.clone(), *v);
                }
            }
            *seq += 1;
            Ok(MemoryCommit {
                id: format!("mem-{seq}"),
                branch: r.branch.clone(),
                message: message.to_string(),
                metadata: metadata.clone(),
                paths,
            })
        })?;
        let id = commit.id.clone();
        self.state().commits.push(commit);
        Ok(id)
    }

    fn promote(
        &self,
        repo: &Path,
        from: &str,
        onto: &str,
        message: &str,
        metadata: &BTreeMap<String, String>,
    ) -> EngineResult<Option<CommitId>> {
        self.enter(EngineOp::Promote)?;
        let commit = self.with_repo(repo, |r, seq| {
            let Some(tree) = r.heads.get(from).cloned() else {
                return Err(EngineError::new(
                    EngineErrorKind::NotFound,
                    format!("unknown revision '{from}'"),
                ));
            };
            let old = r.heads.get(onto);
            if old == Some(&tree) {
                return Ok(None);
            }
            let old = old.cloned().unwrap_or_default();
            let mut paths: BTreeSet<PathBuf> = tree
                .iter()
                .filter(|(p, v)| old.get(*p) != Some(*v))
                .map(|(p, _)| p.clone())
                .collect();
            paths.extend(old.keys().filter(|p| !tree.contains_key(*p)).cloned());
            r.heads.insert(onto.to_string(), tree);
            *seq += 1;
            Ok(Some(MemoryCommit {
                id: format!("mem-{seq}"),
                branch: onto.to_string(),
                message: message.to_string(),
                metadata: metadata.clone(),
                paths: paths.into_iter().collect(),
            }))
        })?;
        Ok(commit.map(|commit| {
            let id = commit.id.clone();
            self.state().commits.push(commit);
            id
        }))
    }

    fn push(&self, repo: &Path, branch: &str) -> EngineResult<()> {
        self.enter(EngineOp::Push)?;
        self.with_repo(repo, |r, _| {
            if r.heads.contains_key(branch) {
                Ok(())
            } else {
                Err(EngineError::new(
                    EngineErrorKind::NotFound,
                    format!("src refspec {branch} does not match any"),
                ))
            }
        })?;
        self.state()
            .pushes
            .push((repo.to_path_buf(), branch.to_string()));
        Ok(())
    }

    fn status(&self, repo: &Path) -> EngineResult<WorkingStatus> {
        self.enter(EngineOp::Status)?;
        self.with_repo(repo, |r, _| {
            let head = r.head();
            let mut status = WorkingStatus {
                staged: r.staged.iter().cloned().collect(),
                ..WorkingStatus::default()
            };
            for (path, version) in &r.working {
                if r.staged.contains(path) {
                    continue;
                }
                match head.get(path) {
                    None => status.untracked.push(path.clone()),
                    Some(committed) if committed != version => status.modified.push(path.clone()),
                    Some(_) => {}
                }
            }
            Ok(status)
        })
    }

    fn publish_lock(&self, repo: &Path, record: Option<&LockRecord>) -> EngineResult<()> {
        self.enter(EngineOp::PublishLock)?;
        self.with_repo(repo, |r, _| {
            r.mirrored = Some(record.cloned());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_moves_changes_into_head() {
        let engine = MemoryEngine::new();
        let repo = Path::new("/song");
        engine.init(repo).unwrap();
        engine.touch(repo, "mix.als");

        let status = engine.status(repo).unwrap();
        assert_eq!(status.untracked, vec![PathBuf::from("mix.als")]);

        engine.stage(repo, &status.changed_paths()).unwrap();
        let id = engine.commit(repo, "first", &BTreeMap::new()).unwrap();
        assert_eq!(id, "mem-1");
        assert!(engine.status(repo).unwrap().is_clean());

        engine.touch(repo, "mix.als");
        assert_eq!(
            engine.status(repo).unwrap().modified,
            vec![PathBuf::from("mix.als")]
        );
    }

    #[test]
    fn scripted_faults_fire_once_each() {
        let engine = MemoryEngine::new();
        let repo = Path::new("/song");
        engine.init(repo).unwrap();
        engine.fail_times(EngineOp::Push, EngineError::network("reset"), 2);

        assert_eq!(engine.push(repo, "main").unwrap_err().kind, EngineErrorKind::Network);
        assert!(engine.push(repo, "main").is_err());
        engine.push(repo, "main").unwrap();
        assert_eq!(engine.calls(EngineOp::Push), 3);
        assert_eq!(engine.pushes().len(), 1);
    }

    #[test]
    fn checkout_keeps_edits_and_swaps_clean_paths() {
        let engine = MemoryEngine::new();
        let repo = Path::new("/song");
        engine.init(repo).unwrap();
        engine.checkout(repo, "draft", true).unwrap();
        engine.touch(repo, "mix.als");
        engine.stage(repo, &[PathBuf::from("mix.als")]).unwrap();
        engine.commit(repo, "draft", &BTreeMap::new()).unwrap();

        // main never saw mix.als, so it leaves the tree on checkout.
        engine.checkout(repo, "main", false).unwrap();
        assert!(engine.status(repo).unwrap().is_clean());
        assert_eq!(engine.branch_paths(repo, "main"), Some(vec![]));

        engine.touch(repo, "vocals.wav");
        engine.checkout(repo, "draft", false).unwrap();
        let status = engine.status(repo).unwrap();
        assert_eq!(status.untracked, vec![PathBuf::from("vocals.wav")]);
    }

    #[test]
    fn promote_copies_committed_tree_without_checkout() {
        let engine = MemoryEngine::new();
        let repo = Path::new("/song");
        engine.init(repo).unwrap();
        engine.checkout(repo, "draft", true).unwrap();
        engine.touch(repo, "mix.als");
        engine.stage(repo, &[PathBuf::from("mix.als")]).unwrap();
        engine.commit(repo, "draft", &BTreeMap::new()).unwrap();

        let id = engine
            .promote(repo, "draft", "main", "Verse done", &BTreeMap::new())
            .unwrap();
        assert_eq!(id.as_deref(), Some("mem-2"));
        assert!(engine.same_tree(repo, "draft", "main"));
        assert_eq!(engine.current_branch(repo).as_deref(), Some("draft"));
        assert!(engine.status(repo).unwrap().is_clean());
        let last = engine.commits().pop().unwrap();
        assert_eq!(last.branch, "main");
        assert_eq!(last.paths, vec![PathBuf::from("mix.als")]);

        // Nothing new on draft: main already has it.
        assert_eq!(
            engine
                .promote(repo, "draft", "main", "again", &BTreeMap::new())
                .unwrap(),
            None
        );
        assert_eq!(
            engine
                .promote(repo, "nope", "main", "x", &BTreeMap::new())
                .unwrap_err()
                .kind,
            EngineErrorKind::NotFound
        );
    }

    #[test]
    fn unknown_repo_and_branch_are_not_found() {
        let engine = MemoryEngine::new();
        let repo = Path::new("/song");
        assert_eq!(
            engine.status(repo).unwrap_err().kind,
            EngineErrorKind::NotFound
        );
        engine.init(repo).unwrap();
        assert!(engine.checkout(repo, "draft", false).is_err());
        engine.checkout(repo, "draft", true).unwrap();
        assert_eq!(engine.current_branch(repo).as_deref(), Some("draft"));
    }
}
