//! Retry, circuit breaking and offline queueing around engine calls.

pub mod breaker;
pub mod drain;
pub mod operation;
pub mod queue;
pub mod retry;

pub use breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use drain::{DrainReport, QueueDrainer};
pub use operation::{EngineExecutor, Endpoint, OpOutcome, Operation, OperationExecutor};
pub use queue::{OfflineQueue, QueueEntry, QueueStats, QueueStatus};
pub use retry::{is_retryable, RetryPolicy};

use crate::config::{BreakerConfig, Config};
use crate::engine::EngineResult;
use crate::error::{EngineError, EngineErrorKind, ResilienceError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancels a retry loop from outside. Dropping the handle does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl Cancellation {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is dropped first.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

/// Shared retry policy plus one circuit breaker per endpoint.
#[derive(Debug)]
pub struct Resilience {
    policy: RetryPolicy,
    breakers: Mutex<BTreeMap<Endpoint, CircuitBreaker>>,
    breaker_cfg: BreakerConfig,
}

impl Resilience {
    pub fn new(policy: RetryPolicy, breaker_cfg: BreakerConfig) -> Self {
        Self {
            policy,
            breakers: Mutex::new(BTreeMap::new()),
            breaker_cfg,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(RetryPolicy::from(&cfg.retry), cfg.breaker.clone())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn breakers(&self) -> MutexGuard<'_, BTreeMap<Endpoint, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_breaker<T>(&self, endpoint: Endpoint, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self.breakers();
        let breaker = breakers
            .entry(endpoint)
            .or_insert_with(|| CircuitBreaker::from_config(endpoint.to_string(), &self.breaker_cfg));
        f(breaker)
    }

    pub fn allow(&self, endpoint: Endpoint) -> bool {
        self.with_breaker(endpoint, |b| b.allow_request())
    }

    pub fn breaker_state(&self, endpoint: Endpoint) -> BreakerState {
        self.with_breaker(endpoint, |b| b.state())
    }

    pub fn breaker_stats(&self) -> BTreeMap<Endpoint, BreakerStats> {
        let mut out = BTreeMap::new();
        for endpoint in [Endpoint::Engine, Endpoint::Remote] {
            out.insert(endpoint, self.with_breaker(endpoint, |b| b.stats()));
        }
        out
    }

    /// Feed a call result into the endpoint's breaker. Fatal errors count as
    /// success: the endpoint answered, it just said no.
    pub fn record(&self, endpoint: Endpoint, result: &EngineResult<OpOutcome>) {
        self.with_breaker(endpoint, |b| match result {
            Err(e) if is_retryable(e) => b.record_failure(),
            _ => b.record_success(),
        })
    }

    /// Give back a HalfOpen trial slot that was granted but not used.
    pub fn cancel_trial(&self, endpoint: Endpoint) {
        self.with_breaker(endpoint, |b| b.cancel_trial())
    }

    pub fn reset(&self) {
        for breaker in self.breakers().values_mut() {
            breaker.reset();
        }
    }

    /// Run `op` with retries. When attempts run out, or the breaker refuses
    /// the call, and the breaker is not Closed, the operation is persisted to
    /// `queue` (if given) and `Queued` is returned instead of losing it.
    pub async fn execute(
        &self,
        executor: Arc<dyn OperationExecutor>,
        repo: &Path,
        op: Operation,
        queue: Option<&OfflineQueue>,
        cancel: &Cancellation,
    ) -> Result<OpOutcome, ResilienceError> {
        let endpoint = op.endpoint();
        let mut last: Option<EngineError> = None;
        let mut attempts = 0;

        while attempts < self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            if !self.allow(endpoint) {
                break;
            }
            attempts += 1;
            let result = run_blocking(executor.clone(), repo.to_path_buf(), op.clone()).await;
            self.record(endpoint, &result);
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if !is_retryable(&e) => {
                    tracing::error!(repo = %repo.display(), op = %op.label(), error = %e, "fatal engine error");
                    return Err(ResilienceError::Fatal(e));
                }
                Err(e) => {
                    tracing::warn!(
                        repo = %repo.display(),
                        op = %op.label(),
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "transient engine error"
                    );
                    last = Some(e);
                }
            }
            if attempts < self.policy.max_attempts {
                let delay = self.policy.delay_for_attempt(attempts);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                }
            }
        }

        self.give_up(endpoint, repo, op, queue, attempts, last)
    }

    fn give_up(
        &self,
        endpoint: Endpoint,
        repo: &Path,
        op: Operation,
        queue: Option<&OfflineQueue>,
        attempts: u32,
        last: Option<EngineError>,
    ) -> Result<OpOutcome, ResilienceError> {
        let state = self.breaker_state(endpoint);
        let reason = match &last {
            Some(e) => format!("{e} (breaker {state})"),
            None => format!("circuit {state} for {endpoint}"),
        };
        if state != BreakerState::Closed {
            if let Some(queue) = queue {
                match queue.enqueue(op) {
                    Ok(entry) => {
                        return Err(ResilienceError::Queued {
                            id: entry.id,
                            reason,
                        })
                    }
                    Err(e) => tracing::error!(
                        repo = %repo.display(),
                        error = %e,
                        "failed to persist operation to offline queue"
                    ),
                }
            }
        }
        match last {
            Some(last) => Err(ResilienceError::RetriesExhausted { attempts, last }),
            None => Err(ResilienceError::CircuitOpen {
                endpoint: endpoint.to_string(),
            }),
        }
    }
}

/// Run a blocking engine call off the async workers.
pub(crate) async fn run_blocking(
    executor: Arc<dyn OperationExecutor>,
    repo: PathBuf,
    op: Operation,
) -> EngineResult<OpOutcome> {
    tokio::task::spawn_blocking(move || executor.execute(&repo, &op))
        .await
        .unwrap_or_else(|e| {
            Err(EngineError::new(
                EngineErrorKind::Other,
                format!("engine task failed: {e}"),
            ))
        })
}
