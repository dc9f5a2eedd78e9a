use super::operation::{OpOutcome, OperationExecutor};
use super::queue::OfflineQueue;
use super::{is_retryable, run_blocking, Resilience};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    /// Draining stopped early: the breaker refused or a transient error hit.
    pub deferred: bool,
}

/// Delivers queued operations, oldest first, one at a time.
#[derive(Debug, Clone)]
pub struct QueueDrainer {
    resilience: Arc<Resilience>,
    executor: Arc<dyn OperationExecutor>,
}

impl QueueDrainer {
    pub fn new(resilience: Arc<Resilience>, executor: Arc<dyn OperationExecutor>) -> Self {
        Self {
            resilience,
            executor,
        }
    }

    /// Drain `queue` until it is empty or delivery has to wait. Each entry is
    /// checkpointed before it runs and removed only after it succeeds. A
    /// transient failure puts it back at the head and stops the pass, so
    /// order is preserved; a fatal one marks it `Failed` and moves on.
    pub async fn drain_once(&self, queue: &OfflineQueue) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        loop {
            let Some(entry) = queue.next_pending()? else {
                break;
            };
            let endpoint = entry.operation.endpoint();
            if !self.resilience.allow(endpoint) {
                tracing::debug!(repo = %queue.root().display(), %endpoint, "breaker open, deferring queue drain");
                report.deferred = true;
                break;
            }
            let Some(entry) = queue.claim_next()? else {
                self.resilience.cancel_trial(endpoint);
                break;
            };

            let result = run_blocking(
                self.executor.clone(),
                entry.repo.clone(),
                entry.operation.clone(),
            )
            .await;
            self.resilience.record(endpoint, &result);

            match result {
                Ok(outcome) => {
                    queue.complete(entry.id)?;
                    report.delivered += 1;
                    tracing::info!(
                        repo = %queue.root().display(),
                        id = %entry.id,
                        op = %entry.operation.label(),
                        attempts = entry.attempts,
                        nothing_to_commit = outcome == OpOutcome::NothingToCommit,
                        "queued operation delivered"
                    );
                }
                Err(e) if is_retryable(&e) => {
                    queue.retry_later(entry.id, &e.to_string())?;
                    tracing::warn!(
                        repo = %queue.root().display(),
                        id = %entry.id,
                        error = %e,
                        "queued operation still failing, will retry"
                    );
                    report.deferred = true;
                    break;
                }
                Err(e) => {
                    queue.fail(entry.id, &e.to_string())?;
                    report.failed += 1;
                    tracing::error!(
                        repo = %queue.root().display(),
                        id = %entry.id,
                        error = %e,
                        "queued operation failed permanently"
                    );
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::engine::{EngineOp, MemoryEngine, VcsEngine};
    use crate::error::EngineError;
    use crate::resilience::operation::{EngineExecutor, Endpoint, Operation};
    use crate::resilience::retry::RetryPolicy;
    use crate::error::ResilienceError;
    use crate::resilience::{BreakerState, Cancellation, QueueStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn resilience() -> Arc<Resilience> {
        Arc::new(Resilience::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                jitter: Duration::ZERO,
            },
            BreakerConfig {
                failure_threshold: 3,
                cool_down_secs: 30,
            },
        ))
    }

    fn push(branch: &str) -> Operation {
        Operation::Push {
            branch: branch.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_while_open_drains_exactly_once_after_restart() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        engine.fail_times(EngineOp::Push, EngineError::network("offline"), 3);
        let exec: Arc<dyn OperationExecutor> = Arc::new(EngineExecutor::new(engine.clone()));

        // First process: the remote is down, the push ends up queued.
        {
            let r = resilience();
            let queue = OfflineQueue::new(dir.path());
            let err = r
                .execute(exec.clone(), dir.path(), push("main"), Some(&queue), &Cancellation::never())
                .await
                .unwrap_err();
            assert!(matches!(err, ResilienceError::Queued { .. }));
            assert_eq!(r.breaker_state(Endpoint::Remote), BreakerState::Open);
        }

        // Second process: fresh breaker, queue reopened from disk.
        let queue = OfflineQueue::new(dir.path());
        queue.startup_recovery().unwrap();
        let drainer = QueueDrainer::new(resilience(), exec);

        let report = drainer.drain_once(&queue).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(!report.deferred);
        let again = drainer.drain_once(&queue).await.unwrap();
        assert_eq!(again.delivered, 0);

        assert_eq!(engine.pushes().len(), 1);
        assert!(queue.list().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn crash_after_checkpoint_is_replayed_once() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        let exec: Arc<dyn OperationExecutor> = Arc::new(EngineExecutor::new(engine.clone()));

        let queue = OfflineQueue::new(dir.path());
        queue.enqueue(push("main")).unwrap();
        // Simulated crash: claimed but never completed.
        queue.claim_next().unwrap().unwrap();

        let drainer = QueueDrainer::new(resilience(), exec);
        assert_eq!(drainer.drain_once(&queue).await.unwrap().delivered, 0);

        let reopened = OfflineQueue::new(dir.path());
        assert_eq!(reopened.startup_recovery().unwrap(), 1);
        assert_eq!(drainer.drain_once(&reopened).await.unwrap().delivered, 1);
        assert_eq!(engine.pushes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_keeps_order_and_stops() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        engine.checkout(dir.path(), "draft", true).unwrap();
        engine.fail_next(EngineOp::Push, EngineError::network("reset"));
        let exec: Arc<dyn OperationExecutor> = Arc::new(EngineExecutor::new(engine.clone()));

        let queue = OfflineQueue::new(dir.path());
        let first = queue.enqueue(push("main")).unwrap();
        queue.enqueue(push("draft")).unwrap();

        let drainer = QueueDrainer::new(resilience(), exec);
        let report = drainer.drain_once(&queue).await.unwrap();
        assert!(report.deferred);
        assert_eq!(report.delivered, 0);
        let head = queue.list().unwrap().remove(0);
        assert_eq!(head.id, first.id);
        assert_eq!(head.status, QueueStatus::Pending);
        assert_eq!(head.attempts, 1);

        let report = drainer.drain_once(&queue).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(
            engine.pushes().iter().map(|(_, b)| b.as_str()).collect::<Vec<_>>(),
            vec!["main", "draft"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_parked_and_drain_continues() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        engine.init(dir.path()).unwrap();
        engine.fail_next(EngineOp::Push, EngineError::auth("token revoked"));
        let exec: Arc<dyn OperationExecutor> = Arc::new(EngineExecutor::new(engine.clone()));

        let queue = OfflineQueue::new(dir.path());
        queue.enqueue(push("main")).unwrap();
        queue.enqueue(Operation::MirrorLock { record: None }).unwrap();

        let drainer = QueueDrainer::new(resilience(), exec);
        let report = drainer.drain_once(&queue).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total, 1);
    }
}
