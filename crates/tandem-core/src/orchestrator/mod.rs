//! Commit orchestrator.
//!
//! Turns `CommitIntent`s into engine operations routed through the
//! resilience layer. Drafts run in the background and their failures land in
//! the audit log; milestones run in the caller's task and report failures
//! directly. A milestone or emergency commit cancels any still-retrying
//! draft for the same repository, since it captures the same working tree.

pub mod intent;
pub mod metadata;

pub use intent::{CommitIntent, CommitKind, Trigger};
pub use metadata::{ArtifactCleaner, MilestoneMetadata};

use crate::audit::{AuditLog, AuditOperation};
use crate::clock::Clock;
use crate::config::BranchConfig;
use crate::engine::CommitId;
use crate::error::{EngineError, EngineErrorKind, OrchestratorError};
use crate::resilience::{
    cancellation, CancelHandle, Cancellation, OfflineQueue, OpOutcome, Operation,
    OperationExecutor, Resilience,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed { commit_id: CommitId, branch: String },
    /// The working tree already matched the last commit.
    NothingToCommit,
}

#[derive(Debug)]
struct DraftSlot {
    generation: u64,
    cancel: CancelHandle,
}

#[derive(Debug)]
pub struct CommitOrchestrator {
    resilience: Arc<Resilience>,
    executor: Arc<dyn OperationExecutor>,
    clock: Arc<dyn Clock>,
    actor: String,
    branches: BranchConfig,
    push_after_commit: bool,
    cleaner: Option<Arc<dyn ArtifactCleaner>>,
    queue_waker: Option<Arc<Notify>>,
    drafts: Mutex<HashMap<PathBuf, DraftSlot>>,
    next_generation: Mutex<u64>,
}

impl CommitOrchestrator {
    pub fn new(
        resilience: Arc<Resilience>,
        executor: Arc<dyn OperationExecutor>,
        clock: Arc<dyn Clock>,
        actor: &str,
        branches: BranchConfig,
    ) -> Self {
        Self {
            resilience,
            executor,
            clock,
            actor: actor.to_string(),
            branches,
            push_after_commit: false,
            cleaner: None,
            queue_waker: None,
            drafts: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
        }
    }

    pub fn with_push_after_commit(mut self, enabled: bool) -> Self {
        self.push_after_commit = enabled;
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn ArtifactCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    pub fn with_queue_waker(mut self, waker: Arc<Notify>) -> Self {
        self.queue_waker = Some(waker);
        self
    }

    pub fn branches(&self) -> &BranchConfig {
        &self.branches
    }

    pub fn queue_for(&self, repo: &Path) -> OfflineQueue {
        let queue = OfflineQueue::new(repo);
        match &self.queue_waker {
            Some(waker) => queue.with_waker(waker.clone()),
            None => queue,
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run one intent through the resilience layer. Unchanged trees come back
    /// as `NothingToCommit`, which is success.
    pub async fn execute(
        &self,
        intent: &CommitIntent,
        cancel: &Cancellation,
    ) -> Result<CommitOutcome, OrchestratorError> {
        let queue = self.queue_for(&intent.repo);
        let outcome = self
            .resilience
            .execute(
                self.executor.clone(),
                &intent.repo,
                intent.to_operation(),
                Some(&queue),
                cancel,
            )
            .await?;
        match outcome {
            OpOutcome::Committed { commit_id } => {
                tracing::info!(
                    repo = %intent.repo.display(),
                    kind = %intent.kind,
                    branch = %intent.target_branch,
                    commit = %commit_id,
                    "commit recorded"
                );
                if self.push_after_commit && intent.kind != CommitKind::Emergency {
                    self.push(intent, &queue, cancel).await;
                }
                Ok(CommitOutcome::Committed {
                    commit_id,
                    branch: intent.target_branch.clone(),
                })
            }
            OpOutcome::NothingToCommit => {
                tracing::debug!(repo = %intent.repo.display(), kind = %intent.kind, "nothing to commit");
                Ok(CommitOutcome::NothingToCommit)
            }
            other => Err(OrchestratorError::EngineFailure(EngineError::new(
                EngineErrorKind::Other,
                format!("unexpected outcome for commit: {other:?}"),
            ))),
        }
    }

    /// Push failures never fail the commit; the resilience layer queues the
    /// push when the remote is down.
    async fn push(&self, intent: &CommitIntent, queue: &OfflineQueue, cancel: &Cancellation) {
        let op = Operation::Push {
            branch: intent.target_branch.clone(),
        };
        if let Err(e) = self
            .resilience
            .execute(self.executor.clone(), &intent.repo, op, Some(queue), cancel)
            .await
        {
            tracing::warn!(repo = %intent.repo.display(), error = %e, "push after commit did not complete");
        }
    }

    // -----------------------------------------------------------------------
    // Drafts
    // -----------------------------------------------------------------------

    /// Run a draft in the background, superseding any draft still retrying
    /// for the same repository. Failures are recorded in the audit log only.
    pub fn submit_draft(self: &Arc<Self>, intent: CommitIntent) -> JoinHandle<()> {
        let (handle, cancel) = cancellation();
        let generation = {
            let mut next = lock(&self.next_generation);
            *next += 1;
            *next
        };
        if let Some(old) = lock(&self.drafts).insert(
            intent.repo.clone(),
            DraftSlot {
                generation,
                cancel: handle,
            },
        ) {
            tracing::debug!(repo = %intent.repo.display(), "superseding earlier draft");
            old.cancel.cancel();
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.execute(&intent, &cancel).await;
            this.finish_draft(&intent.repo, generation);
            match &result {
                Err(OrchestratorError::Cancelled) => {
                    tracing::debug!(repo = %intent.repo.display(), "draft cancelled");
                }
                Err(e) => {
                    tracing::warn!(repo = %intent.repo.display(), error = %e, "draft commit failed");
                    this.audit(&intent, &result);
                }
                Ok(_) => {}
            }
        })
    }

    /// Cancel a still-running draft for `repo`. Returns whether one existed.
    pub fn cancel_draft(&self, repo: &Path) -> bool {
        match lock(&self.drafts).remove(repo) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, slot) in lock(&self.drafts).drain() {
            slot.cancel.cancel();
        }
    }

    fn finish_draft(&self, repo: &Path, generation: u64) {
        let mut drafts = lock(&self.drafts);
        if drafts.get(repo).map(|s| s.generation) == Some(generation) {
            drafts.remove(repo);
        }
    }

    // -----------------------------------------------------------------------
    // Milestones and emergencies
    // -----------------------------------------------------------------------

    /// Manual milestone: promote the draft branch, including edits not yet
    /// drafted, onto the working branch. Takes priority over any pending
    /// draft and reports failure to the caller.
    pub async fn commit_now(
        &self,
        repo: &Path,
        metadata: MilestoneMetadata,
    ) -> Result<CommitOutcome, OrchestratorError> {
        if self.cancel_draft(repo) {
            tracing::info!(repo = %repo.display(), "cancelled pending draft for milestone commit");
        }
        if let Some(cleaner) = &self.cleaner {
            match cleaner.clean(repo) {
                Ok(removed) if !removed.is_empty() => {
                    tracing::info!(repo = %repo.display(), removed = removed.len(), "removed regenerable artifacts");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(repo = %repo.display(), error = %e, "artifact cleanup failed"),
            }
        }
        let intent = CommitIntent::milestone(
            repo.to_path_buf(),
            &self.branches.draft,
            &self.branches.working,
            metadata,
        );
        let result = self.execute(&intent, &Cancellation::never()).await;
        self.audit(&intent, &result);
        result
    }

    /// Commit an emergency intent. Always audited, success or not.
    pub async fn execute_emergency(
        &self,
        intent: &CommitIntent,
    ) -> Result<CommitOutcome, OrchestratorError> {
        self.cancel_draft(&intent.repo);
        let result = self.execute(intent, &Cancellation::never()).await;
        self.audit(intent, &result);
        result
    }

    /// Dispatch intents until the channel closes.
    pub async fn run(self: Arc<Self>, mut intents: mpsc::Receiver<CommitIntent>) {
        while let Some(intent) = intents.recv().await {
            match intent.kind {
                CommitKind::Draft => {
                    self.submit_draft(intent);
                }
                CommitKind::Emergency => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let _ = this.execute_emergency(&intent).await;
                    });
                }
                CommitKind::Milestone => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        let metadata = intent.milestone.clone().unwrap_or_default();
                        if let Err(e) = this.commit_now(&intent.repo, metadata).await {
                            tracing::error!(repo = %intent.repo.display(), error = %e, "milestone commit failed");
                        }
                    });
                }
            }
        }
        tracing::debug!("commit orchestrator stopped");
    }

    // -----------------------------------------------------------------------
    // Audit
    // -----------------------------------------------------------------------

    pub fn audit(&self, intent: &CommitIntent, result: &Result<CommitOutcome, OrchestratorError>) {
        let operation = match intent.kind {
            CommitKind::Draft => AuditOperation::DraftCommit,
            CommitKind::Milestone => AuditOperation::MilestoneCommit,
            CommitKind::Emergency => AuditOperation::EmergencyCommit,
        };
        let (success, details) = match result {
            Ok(CommitOutcome::Committed { commit_id, branch }) => {
                (true, format!("{commit_id} on {branch} ({})", intent.trigger))
            }
            Ok(CommitOutcome::NothingToCommit) => {
                (true, format!("nothing to commit ({})", intent.trigger))
            }
            Err(e) => (false, format!("{e} ({})", intent.trigger)),
        };
        self.write_audit(intent, operation, success, details);
    }

    /// Record an emergency commit abandoned at the power deadline. The engine
    /// call may still finish in the background.
    pub fn audit_timeout(&self, intent: &CommitIntent, budget: Duration) {
        self.write_audit(
            intent,
            AuditOperation::EmergencyCommit,
            false,
            format!(
                "timed out after {}ms ({}); commit may still complete",
                budget.as_millis(),
                intent.trigger
            ),
        );
    }

    fn write_audit(
        &self,
        intent: &CommitIntent,
        operation: AuditOperation,
        success: bool,
        details: String,
    ) {
        let log = AuditLog::new(&intent.repo);
        if let Err(e) = log.record(self.clock.now(), operation, &self.actor, success, details) {
            tracing::error!(repo = %intent.repo.display(), error = %e, "failed to write commit audit entry");
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::BreakerConfig;
    use crate::engine::{EngineOp, MemoryEngine, VcsEngine};
    use crate::resilience::{EngineExecutor, RetryPolicy};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        engine: Arc<MemoryEngine>,
        orch: Arc<CommitOrchestrator>,
    }

    impl Fixture {
        fn repo(&self) -> &Path {
            self.dir.path()
        }

        fn audit(&self, op: AuditOperation) -> Vec<crate::audit::AuditEntry> {
            AuditLog::new(self.repo()).filter(op).unwrap()
        }
    }

    fn fixture(configure: impl FnOnce(CommitOrchestrator) -> CommitOrchestrator) -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        let resilience = Arc::new(Resilience::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(4),
                jitter: Duration::ZERO,
            },
            BreakerConfig::default(),
        ));
        let orch = CommitOrchestrator::new(
            resilience,
            Arc::new(EngineExecutor::new(engine.clone())),
            Arc::new(SystemClock),
            "alice",
            BranchConfig::default(),
        );
        Fixture {
            dir,
            engine,
            orch: Arc::new(configure(orch)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_tree_is_nothing_to_commit() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        let intent = CommitIntent::draft(f.repo().to_path_buf(), "draft", vec!["mix.als".into()]);

        let first = f.orch.execute(&intent, &Cancellation::never()).await.unwrap();
        let second = f.orch.execute(&intent, &Cancellation::never()).await.unwrap();
        assert!(matches!(first, CommitOutcome::Committed { ref branch, .. } if branch == "draft"));
        assert_eq!(second, CommitOutcome::NothingToCommit);
        assert_eq!(f.engine.commits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn milestone_cancels_retrying_draft() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "vocals.wav");
        f.engine
            .fail_next(EngineOp::Commit, EngineError::network("connection reset"));

        let draft = f.orch.submit_draft(CommitIntent::draft(
            f.repo().to_path_buf(),
            "draft",
            vec!["vocals.wav".into()],
        ));
        // Let the first draft attempt fail and enter backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let out = f
            .orch
            .commit_now(f.repo(), MilestoneMetadata::new("Vocals comped"))
            .await
            .unwrap();
        draft.await.unwrap();

        assert!(matches!(out, CommitOutcome::Committed { ref branch, .. } if branch == "main"));
        let commits = f.engine.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!((commits[0].branch.as_str(), commits[0].message.as_str()), ("draft", "Vocals comped"));
        assert_eq!((commits[1].branch.as_str(), commits[1].message.as_str()), ("main", "Vocals comped"));
        assert_eq!(f.engine.calls(EngineOp::Commit), 2);
        assert!(f.audit(AuditOperation::DraftCommit).is_empty());
        assert!(f.audit(AuditOperation::MilestoneCommit)[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn milestone_after_draft_promotes_drafted_tree() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        f.orch
            .submit_draft(CommitIntent::draft(f.repo().to_path_buf(), "draft", vec!["mix.als".into()]))
            .await
            .unwrap();

        let out = f
            .orch
            .commit_now(f.repo(), MilestoneMetadata::new("Verse done"))
            .await
            .unwrap();
        assert!(matches!(out, CommitOutcome::Committed { ref branch, .. } if branch == "main"));
        assert_eq!(
            f.engine.branch_paths(f.repo(), "main"),
            Some(vec![PathBuf::from("mix.als")])
        );
        // Work continues on the draft branch with nothing left over.
        assert_eq!(f.engine.current_branch(f.repo()).as_deref(), Some("draft"));
        assert!(f.engine.status(f.repo()).unwrap().is_clean());
        let entry = &f.audit(AuditOperation::MilestoneCommit)[0];
        assert!(entry.success && entry.details.contains("on main"), "{}", entry.details);
    }

    // Real time: the engine latency is a blocking sleep.
    #[tokio::test]
    async fn milestone_waits_for_draft_already_in_engine() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        f.engine.set_latency(EngineOp::Status, Duration::from_millis(300));

        let draft = f.orch.submit_draft(CommitIntent::draft(
            f.repo().to_path_buf(),
            "draft",
            vec!["mix.als".into()],
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        let out = f
            .orch
            .commit_now(f.repo(), MilestoneMetadata::new("Intro"))
            .await
            .unwrap();
        draft.await.unwrap();

        assert!(matches!(out, CommitOutcome::Committed { ref branch, .. } if branch == "main"));
        // Only the draft staged anything; the milestone found it committed.
        assert_eq!(f.engine.calls(EngineOp::Stage), 1);
        assert!(f.engine.same_tree(f.repo(), "draft", "main"));
        assert!(f.audit(AuditOperation::DraftCommit).iter().all(|e| e.success));
    }

    #[tokio::test(start_paused = true)]
    async fn milestone_failure_is_surfaced_and_audited() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        f.engine
            .fail_next(EngineOp::Commit, EngineError::auth("token revoked"));

        let err = f
            .orch
            .commit_now(f.repo(), MilestoneMetadata::new("Mix v3"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EngineFailure(_)));
        let entries = f.audit(AuditOperation::MilestoneCommit);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn draft_failure_goes_to_audit_log() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        f.engine
            .fail_next(EngineOp::Commit, EngineError::new(EngineErrorKind::Corrupt, "bad object"));

        f.orch
            .submit_draft(CommitIntent::draft(f.repo().to_path_buf(), "draft", vec![]))
            .await
            .unwrap();
        let entries = f.audit(AuditOperation::DraftCommit);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert!(entries[0].details.contains("bad object"));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_draft_supersedes_older() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "a.wav");
        f.engine
            .fail_next(EngineOp::Commit, EngineError::network("reset"));
        let intent = CommitIntent::draft(f.repo().to_path_buf(), "draft", vec![]);

        let first = f.orch.submit_draft(intent.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = f.orch.submit_draft(intent);
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(f.engine.commits().len(), 1);
        assert!(!f.orch.cancel_draft(f.repo()));
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_commit_is_always_audited() {
        let f = fixture(|o| o);
        f.engine.touch(f.repo(), "mix.als");
        let intent = CommitIntent::emergency(
            f.repo().to_path_buf(),
            "draft",
            Trigger::Power(crate::power::PowerSignalKind::WillPowerOff),
            vec!["mix.als".into()],
        );
        f.orch.execute_emergency(&intent).await.unwrap();
        f.orch.execute_emergency(&intent).await.unwrap();

        let entries = f.audit(AuditOperation::EmergencyCommit);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].details.contains("will_power_off"));
        assert!(entries[1].details.starts_with("nothing to commit"));
    }

    #[tokio::test(start_paused = true)]
    async fn push_after_commit_and_cleaner() {
        #[derive(Debug)]
        struct Cleaner(std::sync::atomic::AtomicU32);
        impl ArtifactCleaner for Cleaner {
            fn clean(&self, _repo: &Path) -> std::io::Result<Vec<PathBuf>> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(vec![PathBuf::from("Renders/cache.peak")])
            }
        }
        let cleaner = Arc::new(Cleaner(Default::default()));
        let f = fixture({
            let cleaner = cleaner.clone();
            move |o| o.with_push_after_commit(true).with_cleaner(cleaner)
        });
        f.engine.touch(f.repo(), "mix.als");

        f.orch
            .commit_now(f.repo(), MilestoneMetadata::new("Release"))
            .await
            .unwrap();
        assert_eq!(cleaner.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(
            f.engine.pushes(),
            vec![(f.repo().to_path_buf(), "main".to_string())]
        );
    }
}
