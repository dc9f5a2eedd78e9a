//! Durable offline queue, one per repository.
//!
//! Entries live in `.tandem/queue.json` and are mutated only while holding
//! the `.tandem/queue.guard` file lock. Delivery is at-least-once:
//!
//! ```text
//! Pending → InFlight (checkpoint, attempts += 1) → removed (complete)
//!                    ↘ Pending (retry_later)  ↘ Failed (fatal, kept)
//! ```
//!
//! An entry is checkpointed `InFlight` before it is executed and removed only
//! after it succeeds. The claim names the queue handle that made it, and that
//! handle keeps `.tandem/leases/<owner>.lease` locked while it lives. On
//! restart `startup_recovery` returns to `Pending` only the `InFlight` entries
//! whose lease is gone or no longer locked, so a claim held by a live process
//! is never taken over. Replaying a recovered entry is safe because commits
//! re-check the working tree and report `NothingToCommit` when the earlier
//! attempt landed.

use super::operation::Operation;
use crate::error::{Result, TandemError};
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// QueueStatus / QueueEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    /// Checkpointed before execution. Survives a crash mid-delivery.
    InFlight,
    /// Fatal failure; kept for inspection and never retried.
    Failed { reason: String },
}

impl QueueStatus {
    pub fn label(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub repo: PathBuf,
    pub operation: Operation,
    pub status: QueueStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Lease owner of an `InFlight` claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    entries: Vec<QueueEntry>,
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Proof that the handle owning `owner`'s claims is alive: a lease file held
/// under an exclusive lock until drop. A crashed process loses the lock.
#[derive(Debug)]
struct Lease {
    owner: Uuid,
    path: PathBuf,
    file: File,
}

impl Lease {
    fn acquire(root: &Path) -> Result<Self> {
        let owner = Uuid::new_v4();
        let path = paths::lease_path(root, &owner.to_string());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        FileExt::try_lock_exclusive(&file)?;
        Ok(Self { owner, path, file })
    }

    /// Whether some live handle still holds `owner`'s lease. A lease file
    /// that can be locked was left by a dead process and is removed.
    fn is_held(root: &Path, owner: Uuid) -> bool {
        let path = paths::lease_path(root, &owner.to_string());
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::warn!(lease = %path.display(), error = %e, "cannot inspect queue lease");
                return true;
            }
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                let _ = std::fs::remove_file(&path);
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// OfflineQueue
// ---------------------------------------------------------------------------

/// Handle on one repository's queue. Clones share the claim lease, which is
/// taken on the first claim and released when the last clone drops.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    root: PathBuf,
    path: PathBuf,
    guard: PathBuf,
    waker: Option<Arc<Notify>>,
    lease: Arc<Mutex<Option<Lease>>>,
}

impl OfflineQueue {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            path: paths::queue_path(root),
            guard: paths::queue_guard_path(root),
            waker: None,
            lease: Arc::new(Mutex::new(None)),
        }
    }

    /// Notify `waker` whenever an entry is enqueued, so a drainer can start
    /// without waiting for its next interval.
    pub fn with_waker(mut self, waker: Arc<Notify>) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enqueue(&self, operation: Operation) -> Result<QueueEntry> {
        let now = Utc::now();
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            repo: self.root.clone(),
            operation,
            status: QueueStatus::Pending,
            attempts: 0,
            enqueued_at: now,
            updated_at: now,
            last_error: None,
            claimed_by: None,
        };
        self.mutate(|file| {
            file.entries.push(entry.clone());
            Ok(())
        })?;
        tracing::info!(
            repo = %self.root.display(),
            id = %entry.id,
            op = %entry.operation.label(),
            "operation queued for later delivery"
        );
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
        Ok(entry)
    }

    /// All entries in FIFO order.
    pub fn list(&self) -> Result<Vec<QueueEntry>> {
        io::with_exclusive(&self.guard, || Ok(self.read()?.entries))
    }

    /// The oldest `Pending` entry, or `None` when the queue is empty or an
    /// entry is already in flight.
    pub fn next_pending(&self) -> Result<Option<QueueEntry>> {
        io::with_exclusive(&self.guard, || {
            let file = self.read()?;
            if file
                .entries
                .iter()
                .any(|e| e.status == QueueStatus::InFlight)
            {
                return Ok(None);
            }
            Ok(file
                .entries
                .into_iter()
                .find(|e| e.status == QueueStatus::Pending))
        })
    }

    /// Atomically pick the oldest `Pending` entry and checkpoint it
    /// `InFlight`. Returns `None` when nothing is pending or another entry is
    /// already in flight, so at most one operation per repository is ever
    /// being delivered, across processes.
    pub fn claim_next(&self) -> Result<Option<QueueEntry>> {
        let owner = self.owner()?;
        self.mutate(|file| {
            if file
                .entries
                .iter()
                .any(|e| e.status == QueueStatus::InFlight)
            {
                return Ok(None);
            }
            let Some(entry) = file
                .entries
                .iter_mut()
                .find(|e| e.status == QueueStatus::Pending)
            else {
                return Ok(None);
            };
            entry.status = QueueStatus::InFlight;
            entry.attempts += 1;
            entry.claimed_by = Some(owner);
            entry.updated_at = Utc::now();
            Ok(Some(entry.clone()))
        })
    }

    /// Mark `id` in flight before executing it.
    pub fn checkpoint(&self, id: Uuid) -> Result<QueueEntry> {
        let owner = self.owner()?;
        self.update(id, |e| {
            e.status = QueueStatus::InFlight;
            e.attempts += 1;
            e.claimed_by = Some(owner);
        })
    }

    /// Remove a delivered entry.
    pub fn complete(&self, id: Uuid) -> Result<()> {
        self.mutate(|file| {
            file.entries.retain(|e| e.id != id);
            Ok(())
        })
    }

    /// Return an in-flight entry to `Pending` after a transient failure.
    pub fn retry_later(&self, id: Uuid, error: &str) -> Result<QueueEntry> {
        self.update(id, |e| {
            e.status = QueueStatus::Pending;
            e.last_error = Some(error.to_string());
            e.claimed_by = None;
        })
    }

    pub fn fail(&self, id: Uuid, reason: &str) -> Result<QueueEntry> {
        self.update(id, |e| {
            e.status = QueueStatus::Failed {
                reason: reason.to_string(),
            };
            e.last_error = Some(reason.to_string());
            e.claimed_by = None;
        })
    }

    /// Return `InFlight` entries whose claiming handle is gone to `Pending`.
    /// Claims held by a live handle, in this process or another, are left
    /// alone. Returns the number recovered.
    pub fn startup_recovery(&self) -> Result<usize> {
        let mine = self.current_owner();
        let recovered = self.mutate(|file| {
            let mut count = 0;
            for e in file
                .entries
                .iter_mut()
                .filter(|e| e.status == QueueStatus::InFlight)
            {
                if let Some(owner) = e.claimed_by {
                    if Some(owner) == mine || Lease::is_held(&self.root, owner) {
                        continue;
                    }
                }
                e.status = QueueStatus::Pending;
                e.claimed_by = None;
                e.updated_at = Utc::now();
                count += 1;
            }
            Ok(count)
        })?;
        if recovered > 0 {
            tracing::info!(repo = %self.root.display(), recovered, "recovered in-flight queue entries");
        }
        Ok(recovered)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        let entries = self.list()?;
        let mut stats = QueueStats {
            total: entries.len(),
            ..QueueStats::default()
        };
        for e in &entries {
            match e.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::InFlight => stats.in_flight += 1,
                QueueStatus::Failed { .. } => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Drop every `Failed` entry. Returns how many were removed.
    pub fn purge_failed(&self) -> Result<usize> {
        self.mutate(|file| {
            let before = file.entries.len();
            file.entries
                .retain(|e| !matches!(e.status, QueueStatus::Failed { .. }));
            Ok(before - file.entries.len())
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lease(&self) -> std::sync::MutexGuard<'_, Option<Lease>> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_owner(&self) -> Option<Uuid> {
        self.lease().as_ref().map(|l| l.owner)
    }

    /// This handle's lease owner, taking the lease on first use.
    fn owner(&self) -> Result<Uuid> {
        let mut slot = self.lease();
        if let Some(lease) = slot.as_ref() {
            return Ok(lease.owner);
        }
        let lease = Lease::acquire(&self.root)?;
        let owner = lease.owner;
        *slot = Some(lease);
        Ok(owner)
    }

    fn read(&self) -> Result<QueueFile> {
        match io::read_optional(&self.path)? {
            None => Ok(QueueFile::default()),
            Some(data) if data.trim().is_empty() => Ok(QueueFile::default()),
            Some(data) => serde_json::from_str(&data).map_err(|e| TandemError::CorruptRecord {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut QueueFile) -> Result<T>) -> Result<T> {
        io::with_exclusive(&self.guard, || {
            let mut file = self.read()?;
            let out = f(&mut file)?;
            let data = serde_json::to_vec_pretty(&file)?;
            io::atomic_write(&self.path, &data)?;
            Ok(out)
        })
    }

    fn update(&self, id: Uuid, f: impl FnOnce(&mut QueueEntry)) -> Result<QueueEntry> {
        self.mutate(|file| {
            let entry = file
                .entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| TandemError::CorruptRecord {
                    path: self.path.clone(),
                    reason: format!("queue entry {id} not found"),
                })?;
            f(entry);
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn push(branch: &str) -> Operation {
        Operation::Push {
            branch: branch.into(),
        }
    }

    #[test]
    fn fifo_with_single_in_flight() {
        let dir = TempDir::new().unwrap();
        let q = OfflineQueue::new(dir.path());
        let a = q.enqueue(push("a")).unwrap();
        let b = q.enqueue(push("b")).unwrap();

        assert_eq!(q.next_pending().unwrap().unwrap().id, a.id);
        q.checkpoint(a.id).unwrap();
        assert!(q.next_pending().unwrap().is_none());

        q.complete(a.id).unwrap();
        assert_eq!(q.next_pending().unwrap().unwrap().id, b.id);
    }

    #[test]
    fn claim_next_checkpoints_oldest() {
        let dir = TempDir::new().unwrap();
        let q = OfflineQueue::new(dir.path());
        let a = q.enqueue(push("a")).unwrap();
        q.enqueue(push("b")).unwrap();

        let claimed = q.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert_eq!(claimed.status, QueueStatus::InFlight);
        assert_eq!(claimed.attempts, 1);
        assert!(q.claim_next().unwrap().is_none());
    }

    #[test]
    fn survives_reopen_and_recovers_in_flight() {
        let dir = TempDir::new().unwrap();
        let entry = {
            let q = OfflineQueue::new(dir.path());
            let e = q.enqueue(push("draft")).unwrap();
            q.checkpoint(e.id).unwrap();
            e
        };

        let reopened = OfflineQueue::new(dir.path());
        assert_eq!(reopened.stats().unwrap().in_flight, 1);
        assert_eq!(reopened.startup_recovery().unwrap(), 1);
        let next = reopened.next_pending().unwrap().unwrap();
        assert_eq!(next.id, entry.id);
        assert_eq!(next.attempts, 1);
    }

    #[test]
    fn recovery_leaves_live_claims_alone() {
        let dir = TempDir::new().unwrap();
        let drainer = OfflineQueue::new(dir.path());
        let a = drainer.enqueue(push("main")).unwrap();
        let claimed = drainer.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        assert!(claimed.claimed_by.is_some());

        // A second handle starting up while the first is mid-delivery.
        let newcomer = OfflineQueue::new(dir.path());
        assert_eq!(newcomer.startup_recovery().unwrap(), 0);
        assert!(newcomer.claim_next().unwrap().is_none());
        assert_eq!(drainer.startup_recovery().unwrap(), 0);

        drop(drainer);
        assert_eq!(newcomer.startup_recovery().unwrap(), 1);
        let next = newcomer.claim_next().unwrap().unwrap();
        assert_eq!(next.id, a.id);
        assert_eq!(next.attempts, 2);
    }

    #[test]
    fn unlocked_lease_file_from_crash_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let owner = {
            let q = OfflineQueue::new(dir.path());
            let e = q.enqueue(push("draft")).unwrap();
            q.checkpoint(e.id).unwrap().claimed_by.unwrap()
        };
        // A crash leaves the file behind but the OS drops its lock.
        let lease = paths::lease_path(dir.path(), &owner.to_string());
        std::fs::write(&lease, b"").unwrap();

        let q = OfflineQueue::new(dir.path());
        assert_eq!(q.startup_recovery().unwrap(), 1);
        assert!(!lease.exists());
        assert_eq!(q.list().unwrap()[0].claimed_by, None);
    }

    #[test]
    fn failed_entries_are_skipped_and_purgeable() {
        let dir = TempDir::new().unwrap();
        let q = OfflineQueue::new(dir.path());
        let a = q.enqueue(push("a")).unwrap();
        let b = q.enqueue(push("b")).unwrap();
        q.checkpoint(a.id).unwrap();
        q.fail(a.id, "auth: denied").unwrap();

        assert_eq!(q.next_pending().unwrap().unwrap().id, b.id);
        assert_eq!(
            q.stats().unwrap(),
            QueueStats {
                pending: 1,
                in_flight: 0,
                failed: 1,
                total: 2
            }
        );
        assert_eq!(q.purge_failed().unwrap(), 1);
        assert_eq!(q.list().unwrap().len(), 1);
    }

    #[test]
    fn retry_later_records_error() {
        let dir = TempDir::new().unwrap();
        let q = OfflineQueue::new(dir.path());
        let a = q.enqueue(push("a")).unwrap();
        q.checkpoint(a.id).unwrap();
        let e = q.retry_later(a.id, "network: reset").unwrap();
        assert_eq!(e.status, QueueStatus::Pending);
        assert_eq!(e.last_error.as_deref(), Some("network: reset"));
    }

    #[tokio::test]
    async fn enqueue_wakes_drainer() {
        let dir = TempDir::new().unwrap();
        let waker = Arc::new(Notify::new());
        let q = OfflineQueue::new(dir.path()).with_waker(waker.clone());
        q.enqueue(push("a")).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waker.notified())
            .await
            .unwrap();
    }

    #[test]
    fn corrupt_queue_file_is_reported() {
        let dir = TempDir::new().unwrap();
        io::atomic_write(&paths::queue_path(dir.path()), b"[oops").unwrap();
        let q = OfflineQueue::new(dir.path());
        assert!(matches!(q.list(), Err(TandemError::CorruptRecord { .. })));
    }
}
