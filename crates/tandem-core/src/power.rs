//! Power-safety trigger.
//!
//! On sleep or power-off, every open burst is closed through the monitor
//! (which hands back Emergency intents directly) and committed under a hard
//! deadline. Anything still running at the deadline is logged as failed so
//! shutdown is never blocked.

use crate::monitor::MonitorHandle;
use crate::orchestrator::{CommitIntent, CommitOrchestrator, CommitOutcome, Trigger};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSignalKind {
    WillSleep,
    WillPowerOff,
}

impl fmt::Display for PowerSignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerSignalKind::WillSleep => "will_sleep",
            PowerSignalKind::WillPowerOff => "will_power_off",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSignal {
    pub kind: PowerSignalKind,
    /// How long the OS says it will wait. Capped by the hard timeout.
    pub grace: Option<Duration>,
}

impl PowerSignal {
    pub fn new(kind: PowerSignalKind) -> Self {
        Self { kind, grace: None }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = Some(grace);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PowerReport {
    pub preempted: usize,
    pub committed: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug)]
pub struct PowerSafetyTrigger {
    monitor: MonitorHandle,
    orchestrator: Arc<CommitOrchestrator>,
    hard_timeout: Duration,
}

impl PowerSafetyTrigger {
    pub fn new(
        monitor: MonitorHandle,
        orchestrator: Arc<CommitOrchestrator>,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            monitor,
            orchestrator,
            hard_timeout,
        }
    }

    pub fn budget(&self, signal: &PowerSignal) -> Duration {
        signal
            .grace
            .map_or(self.hard_timeout, |g| g.min(self.hard_timeout))
    }

    pub async fn handle(&self, signal: PowerSignal) -> PowerReport {
        let budget = self.budget(&signal);
        let deadline = Instant::now() + budget;
        let mut report = PowerReport::default();

        let intents = match tokio::time::timeout_at(
            deadline,
            self.monitor.preempt(Trigger::Power(signal.kind)),
        )
        .await
        {
            Ok(Ok(intents)) => intents,
            Ok(Err(e)) => {
                tracing::error!(signal = %signal.kind, error = %e, "could not preempt open bursts");
                return report;
            }
            Err(_) => {
                tracing::error!(signal = %signal.kind, ?budget, "timed out preempting open bursts");
                return report;
            }
        };
        report.preempted = intents.len();
        if intents.is_empty() {
            tracing::debug!(signal = %signal.kind, "no open bursts");
            return report;
        }

        let results = futures::future::join_all(
            intents
                .iter()
                .map(|intent| self.commit_before(intent, deadline, budget)),
        )
        .await;
        for result in results {
            match result {
                Some(Ok(CommitOutcome::Committed { .. })) => report.committed += 1,
                Some(Ok(CommitOutcome::NothingToCommit)) => report.unchanged += 1,
                Some(Err(_)) => report.failed += 1,
                None => report.timed_out += 1,
            }
        }
        tracing::info!(
            signal = %signal.kind,
            preempted = report.preempted,
            committed = report.committed,
            failed = report.failed,
            timed_out = report.timed_out,
            "power signal handled"
        );
        report
    }

    async fn commit_before(
        &self,
        intent: &CommitIntent,
        deadline: Instant,
        budget: Duration,
    ) -> Option<Result<CommitOutcome, crate::error::OrchestratorError>> {
        match tokio::time::timeout_at(deadline, self.orchestrator.execute_emergency(intent)).await
        {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::error!(
                    repo = %intent.repo.display(),
                    ?budget,
                    "emergency commit did not finish before the power deadline"
                );
                self.orchestrator.audit_timeout(intent, budget);
                None
            }
        }
    }

    /// Handle signals until the source ends.
    pub async fn run<S>(self: Arc<Self>, signals: S)
    where
        S: Stream<Item = PowerSignal> + Send,
    {
        futures::pin_mut!(signals);
        while let Some(signal) = signals.next().await {
            tracing::warn!(signal = %signal.kind, "power signal received");
            self.handle(signal).await;
        }
        tracing::debug!("power trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditOperation};
    use crate::clock::SystemClock;
    use crate::config::{BranchConfig, BreakerConfig};
    use crate::engine::{EngineOp, MemoryEngine, VcsEngine};
    use crate::monitor::{ChangeKind, ChangeMonitor, FileEvent, MonitorSettings};
    use crate::resilience::{EngineExecutor, Resilience, RetryPolicy};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        dir: TempDir,
        engine: Arc<MemoryEngine>,
        monitor: MonitorHandle,
        _intents: mpsc::Receiver<CommitIntent>,
        trigger: PowerSafetyTrigger,
    }

    async fn fixture(hard_timeout: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        engine.touch(dir.path(), "mix.als");

        let (intent_tx, intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(
            MonitorSettings {
                debounce: Duration::from_secs(15),
                channel_capacity: 16,
                draft_branch: "draft".into(),
            },
            intent_tx,
        );
        monitor.register(dir.path()).await.unwrap();

        let orchestrator = Arc::new(CommitOrchestrator::new(
            Arc::new(Resilience::new(RetryPolicy::no_retry(), BreakerConfig::default())),
            Arc::new(EngineExecutor::new(engine.clone())),
            Arc::new(SystemClock),
            "alice",
            BranchConfig::default(),
        ));
        let trigger = PowerSafetyTrigger::new(monitor.clone(), orchestrator, hard_timeout);
        Fixture {
            dir,
            engine,
            monitor,
            _intents: intents,
            trigger,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn will_sleep_commits_open_burst_before_deadline() {
        let f = fixture(Duration::from_secs(5)).await;
        let start = Instant::now();
        f.monitor
            .events()
            .send(FileEvent::new(f.dir.path().join("mix.als"), ChangeKind::Modified))
            .await
            .unwrap();

        let report = f
            .trigger
            .handle(PowerSignal::new(PowerSignalKind::WillSleep))
            .await;
        assert!(start.elapsed() < Duration::from_secs(15));
        assert_eq!(report.preempted, 1);
        assert_eq!(report.committed, 1);

        let commits = f.engine.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].branch, "draft");
        assert_eq!(commits[0].message, "emergency (will_sleep): 1 path changed");
        let audit = AuditLog::new(f.dir.path())
            .filter(AuditOperation::EmergencyCommit)
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn no_open_burst_means_no_commit() {
        let f = fixture(Duration::from_secs(5)).await;
        let report = f
            .trigger
            .handle(PowerSignal::new(PowerSignalKind::WillPowerOff))
            .await;
        assert_eq!(report, PowerReport::default());
        assert!(f.engine.commits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_is_capped_by_hard_timeout() {
        let f = fixture(Duration::from_secs(5)).await;
        let short = PowerSignal::new(PowerSignalKind::WillSleep).with_grace(Duration::from_secs(2));
        let long = PowerSignal::new(PowerSignalKind::WillSleep).with_grace(Duration::from_secs(30));
        assert_eq!(f.trigger.budget(&short), Duration::from_secs(2));
        assert_eq!(f.trigger.budget(&long), Duration::from_secs(5));
    }

    // Real time: a slow engine call runs on a blocking thread, which would
    // hold a paused clock still.
    #[tokio::test]
    async fn hard_timeout_logs_failure_instead_of_blocking() {
        let f = fixture(Duration::from_millis(100)).await;
        f.engine.set_latency(EngineOp::Commit, Duration::from_millis(800));
        f.monitor
            .events()
            .send(FileEvent::new(f.dir.path().join("mix.als"), ChangeKind::Modified))
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let report = f
            .trigger
            .handle(PowerSignal::new(PowerSignalKind::WillPowerOff))
            .await;
        assert!(start.elapsed() < Duration::from_millis(700));
        assert_eq!(report.preempted, 1);
        assert_eq!(report.timed_out, 1);

        let audit = AuditLog::new(f.dir.path())
            .filter(AuditOperation::EmergencyCommit)
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].success);
        assert!(audit[0].details.contains("timed out"));
    }
}
