//! Runtime registry.
//!
//! Owns every background task and the map of registered repositories. All
//! control-surface calls go through [`RuntimeHandle`]; nothing here is a
//! process-wide singleton, so tests can run several runtimes side by side.

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::VcsEngine;
use crate::error::{LockError, Result, TandemError};
use crate::io;
use crate::lock::{Displaced, LockManager, LockRecord, LockStatus, QueuedMirror};
use crate::monitor::{BurstSnapshot, ChangeMonitor, FileEvent, MonitorHandle, MonitorSettings};
use crate::orchestrator::{CommitOrchestrator, CommitOutcome, MilestoneMetadata};
use crate::paths;
use crate::power::{PowerReport, PowerSafetyTrigger, PowerSignal};
use crate::resilience::{
    BreakerStats, DrainReport, Endpoint, EngineExecutor, OfflineQueue, OperationExecutor,
    QueueDrainer, Resilience,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

const INTENT_CHANNEL_CAPACITY: usize = 64;
const POWER_CHANNEL_CAPACITY: usize = 8;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct RepoEntry {
    locks: LockManager,
    queue: OfflineQueue,
    /// Lock taken through this runtime, renewed by the heartbeat.
    held_lock: Option<String>,
}

type Registry = Arc<Mutex<BTreeMap<PathBuf, RepoEntry>>>;

#[derive(Debug)]
pub struct RuntimeHandle {
    config: Config,
    actor: String,
    clock: Arc<dyn Clock>,
    resilience: Arc<Resilience>,
    drainer: QueueDrainer,
    monitor: MonitorHandle,
    orchestrator: Arc<CommitOrchestrator>,
    power: Arc<PowerSafetyTrigger>,
    power_tx: mpsc::Sender<PowerSignal>,
    queue_waker: Arc<Notify>,
    registry: Registry,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Build the registry and spawn the monitor, orchestrator, power trigger,
    /// queue drainer and (with `lock.auto_renew`) the lock heartbeat. Must be
    /// called inside a tokio runtime.
    pub fn start(
        config: Config,
        actor: &str,
        engine: Arc<dyn VcsEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resilience = Arc::new(Resilience::from_config(&config));
        let executor: Arc<dyn OperationExecutor> = Arc::new(EngineExecutor::new(engine));
        let queue_waker = Arc::new(Notify::new());
        let registry: Registry = Arc::new(Mutex::new(BTreeMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        let (monitor, monitor_task) = ChangeMonitor::spawn(
            MonitorSettings {
                debounce: config.monitor.debounce(),
                channel_capacity: config.monitor.channel_capacity,
                draft_branch: config.branches.draft.clone(),
            },
            intent_tx,
        );
        tasks.push(monitor_task);

        let orchestrator = Arc::new(
            CommitOrchestrator::new(
                resilience.clone(),
                executor.clone(),
                clock.clone(),
                actor,
                config.branches.clone(),
            )
            .with_push_after_commit(config.engine.push_after_commit)
            .with_queue_waker(queue_waker.clone()),
        );
        tasks.push(tokio::spawn(orchestrator.clone().run(intent_rx)));

        let power = Arc::new(PowerSafetyTrigger::new(
            monitor.clone(),
            orchestrator.clone(),
            config.power.hard_timeout(),
        ));
        let (power_tx, power_rx) = mpsc::channel(POWER_CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(
            power.clone().run(ReceiverStream::new(power_rx)),
        ));

        let drainer = QueueDrainer::new(resilience.clone(), executor);
        tasks.push(tokio::spawn(drain_loop(
            drainer.clone(),
            registry.clone(),
            queue_waker.clone(),
            config.queue.drain_interval(),
            shutdown_rx.clone(),
        )));

        if config.lock.auto_renew {
            tasks.push(tokio::spawn(heartbeat_loop(
                registry.clone(),
                actor.to_string(),
                config.lock.default_timeout(),
                config.lock.renew_before(),
                shutdown_rx,
            )));
        }

        tracing::info!(actor = %actor, tasks = tasks.len(), "runtime started");
        Self {
            config,
            actor: actor.to_string(),
            clock,
            resilience,
            drainer,
            monitor,
            orchestrator,
            power,
            power_tx,
            queue_waker,
            registry,
            shutdown_tx,
            tasks,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Start watching `repo`. Interrupted queue deliveries from a previous
    /// run are returned to pending. Registering twice is a no-op.
    pub async fn register_path(&self, repo: &Path) -> Result<()> {
        if registry(&self.registry).contains_key(repo) {
            return Ok(());
        }
        io::ensure_dir(&paths::state_dir(repo))?;
        let queue = OfflineQueue::new(repo).with_waker(self.queue_waker.clone());
        let recovered = queue.startup_recovery()?;
        if recovered > 0 {
            tracing::warn!(repo = %repo.display(), recovered, "requeued interrupted operations");
        }

        let mut locks = LockManager::new(
            repo,
            self.clock.clone(),
            self.config.lock.staleness_window(),
        );
        if self.config.engine.mirror_locks {
            locks = locks.with_mirror(Arc::new(QueuedMirror::new(queue.clone())));
        }

        self.monitor.register(repo).await?;
        registry(&self.registry).insert(
            repo.to_path_buf(),
            RepoEntry {
                locks,
                queue,
                held_lock: None,
            },
        );
        self.queue_waker.notify_one();
        Ok(())
    }

    /// Stop watching `repo`. An open burst is discarded and a pending draft
    /// cancelled. Returns whether it was registered.
    pub async fn unregister_path(&self, repo: &Path) -> Result<bool> {
        self.monitor.unregister(repo).await?;
        self.orchestrator.cancel_draft(repo);
        let removed = registry(&self.registry).remove(repo).is_some();
        if removed {
            tracing::info!(repo = %repo.display(), "repository unregistered");
        }
        Ok(removed)
    }

    pub fn registered(&self) -> Vec<PathBuf> {
        registry(&self.registry).keys().cloned().collect()
    }

    fn entry(&self, repo: &Path) -> Result<RepoEntry> {
        registry(&self.registry)
            .get(repo)
            .cloned()
            .ok_or_else(|| TandemError::NotRegistered(repo.to_path_buf()))
    }

    fn set_held(&self, repo: &Path, lock_id: Option<String>) {
        if let Some(entry) = registry(&self.registry).get_mut(repo) {
            entry.held_lock = lock_id;
        }
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    pub fn acquire_lock(&self, repo: &Path, timeout: Option<chrono::Duration>) -> Result<LockRecord> {
        let timeout = timeout.unwrap_or_else(|| self.config.lock.default_timeout());
        let record = self.entry(repo)?.locks.acquire(&self.actor, timeout)?;
        self.set_held(repo, Some(record.lock_id.clone()));
        Ok(record)
    }

    pub fn release_lock(&self, repo: &Path, lock_id: &str) -> Result<()> {
        self.entry(repo)?.locks.release(&self.actor, lock_id)?;
        self.set_held(repo, None);
        Ok(())
    }

    pub fn renew_lock(
        &self,
        repo: &Path,
        lock_id: &str,
        timeout: Option<chrono::Duration>,
    ) -> Result<DateTime<Utc>> {
        let timeout = timeout.unwrap_or_else(|| self.config.lock.default_timeout());
        self.entry(repo)?.locks.renew(&self.actor, lock_id, timeout)
    }

    pub fn force_break_lock(&self, repo: &Path, justification: &str) -> Result<Displaced> {
        let displaced = self.entry(repo)?.locks.force_break(&self.actor, justification)?;
        self.set_held(repo, None);
        Ok(displaced)
    }

    pub fn lock_status(&self, repo: &Path) -> Result<LockStatus> {
        self.entry(repo)?.locks.status()
    }

    // -----------------------------------------------------------------------
    // Commits and signals
    // -----------------------------------------------------------------------

    /// Manual milestone commit. Failures are returned to the caller.
    pub async fn force_commit_now(
        &self,
        repo: &Path,
        metadata: MilestoneMetadata,
    ) -> Result<CommitOutcome> {
        self.entry(repo)?;
        Ok(self.orchestrator.commit_now(repo, metadata).await?)
    }

    /// Sender for raw file events, for OS watcher callbacks.
    pub fn file_events(&self) -> mpsc::Sender<FileEvent> {
        self.monitor.events()
    }

    /// Sender for power signals handled in the background.
    pub fn power_signals(&self) -> mpsc::Sender<PowerSignal> {
        self.power_tx.clone()
    }

    /// Handle a power signal in the caller's task and wait for the result.
    pub async fn power_event(&self, signal: PowerSignal) -> PowerReport {
        self.power.handle(signal).await
    }

    pub async fn open_bursts(&self) -> Result<Vec<BurstSnapshot>> {
        self.monitor.snapshot().await
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    pub fn queue(&self, repo: &Path) -> Result<OfflineQueue> {
        Ok(self.entry(repo)?.queue)
    }

    pub async fn drain_now(&self, repo: &Path) -> Result<DrainReport> {
        let queue = self.entry(repo)?.queue;
        self.drainer.drain_once(&queue).await
    }

    pub fn breaker_stats(&self) -> BTreeMap<Endpoint, BreakerStats> {
        self.resilience.breaker_stats()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop every task. Pending drafts are cancelled; tasks that do not stop
    /// within the power hard timeout are aborted.
    pub async fn shutdown(self) {
        let RuntimeHandle {
            config,
            monitor,
            orchestrator,
            power_tx,
            shutdown_tx,
            tasks,
            ..
        } = self;
        let _ = shutdown_tx.send(true);
        orchestrator.cancel_all();
        monitor.shutdown().await;
        drop(power_tx);

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let grace = config.power.hard_timeout();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(?grace, "background tasks did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("runtime stopped");
    }
}

fn registry(r: &Registry) -> MutexGuard<'_, BTreeMap<PathBuf, RepoEntry>> {
    r.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn drain_loop(
    drainer: QueueDrainer,
    registry_ref: Registry,
    waker: Arc<Notify>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval.max(Duration::from_millis(100)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
            _ = waker.notified() => {}
        }
        let queues: Vec<OfflineQueue> = registry(&registry_ref)
            .values()
            .map(|e| e.queue.clone())
            .collect();
        for queue in queues {
            match drainer.drain_once(&queue).await {
                Ok(report) if report.delivered > 0 || report.failed > 0 => {
                    tracing::info!(
                        repo = %queue.root().display(),
                        delivered = report.delivered,
                        failed = report.failed,
                        deferred = report.deferred,
                        "offline queue drained"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(repo = %queue.root().display(), error = %e, "queue drain failed");
                }
            }
        }
    }
    tracing::debug!("queue drainer stopped");
}

async fn heartbeat_loop(
    registry_ref: Registry,
    actor: String,
    timeout: chrono::Duration,
    renew_before: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }
        let held: Vec<(PathBuf, LockManager, String)> = registry(&registry_ref)
            .iter()
            .filter_map(|(repo, e)| {
                e.held_lock
                    .clone()
                    .map(|id| (repo.clone(), e.locks.clone(), id))
            })
            .collect();
        for (repo, locks, lock_id) in held {
            match locks.renew_if_expiring(&actor, &lock_id, timeout, renew_before) {
                Ok(Some(expires_at)) => {
                    tracing::debug!(repo = %repo.display(), %expires_at, "heartbeat renewed lock");
                }
                Ok(None) => {}
                Err(TandemError::Lock(e @ (LockError::NotHolder { .. } | LockError::Expired { .. } | LockError::NotFound))) => {
                    tracing::warn!(repo = %repo.display(), error = %e, "held lock lost, heartbeat stopping for it");
                    if let Some(entry) = registry(&registry_ref).get_mut(&repo) {
                        if entry.held_lock.as_deref() == Some(lock_id.as_str()) {
                            entry.held_lock = None;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(repo = %repo.display(), error = %e, "heartbeat renew failed");
                }
            }
        }
    }
    tracing::debug!("lock heartbeat stopped");
}
