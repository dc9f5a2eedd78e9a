//! Lock lifecycle for one repository.
//!
//! Every decision is made against the persisted record through
//! [`LockStore::compare_and_swap`]; nothing here caches a lock in memory.
//! Each transition, refused attempts included, appends exactly one audit
//! entry. If that append fails the transition is rolled back, so a change
//! never stands without its entry.

use super::mirror::LockMirror;
use super::record::{LockRecord, LockStatus};
use super::store::{CasOutcome, Displaced, FileLockStore, LockStore};
use crate::audit::{AuditLog, AuditOperation};
use crate::clock::Clock;
use crate::error::{LockError, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone)]
pub struct LockManager {
    root: PathBuf,
    store: Arc<dyn LockStore>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    staleness: Duration,
    mirror: Option<Arc<dyn LockMirror>>,
}

impl LockManager {
    pub fn new(root: &Path, clock: Arc<dyn Clock>, staleness: Duration) -> Self {
        Self::with_store(root, Arc::new(FileLockStore::new(root)), clock, staleness)
    }

    pub fn with_store(
        root: &Path,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        staleness: Duration,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            store,
            audit: AuditLog::new(root),
            clock,
            staleness,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn LockMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // -----------------------------------------------------------------------
    // acquire
    // -----------------------------------------------------------------------

    /// Take the lock for `actor`. Succeeds when no record exists or the
    /// existing one has expired (logged as a reclaim). A held lock, stale or
    /// not, is refused with `AlreadyHeld`.
    pub fn acquire(&self, actor: &str, timeout: Duration) -> Result<LockRecord> {
        loop {
            let now = self.clock.now();
            let current = self.store.load()?;
            if let Some(held) = current.as_ref().filter(|r| !r.is_expired(now)) {
                self.audit.record(
                    now,
                    AuditOperation::Acquire,
                    actor,
                    false,
                    format!(
                        "refused: held by {} until {}",
                        held.holder,
                        held.expires_at.format(TS_FORMAT)
                    ),
                )?;
                return Err(LockError::AlreadyHeld {
                    holder: held.holder.clone(),
                    expires_at: held.expires_at,
                }
                .into());
            }

            let new = LockRecord::new(actor, now, timeout);
            let expected = current.as_ref().map(|r| r.lock_id.as_str());
            let outcome = self.audited_swap(expected, Some(&new), current.as_ref(), || {
                let (op, details) = match &current {
                    Some(prev) => (
                        AuditOperation::Reclaimed,
                        format!(
                            "lock {} reclaimed from {} (expired {})",
                            new.lock_id,
                            prev.holder,
                            prev.expires_at.format(TS_FORMAT)
                        ),
                    ),
                    None => (
                        AuditOperation::Acquire,
                        format!(
                            "lock {} until {}",
                            new.lock_id,
                            new.expires_at.format(TS_FORMAT)
                        ),
                    ),
                };
                self.audit.record(now, op, actor, true, details).map(|_| ())
            })?;

            match outcome {
                CasOutcome::Swapped => {
                    tracing::info!(
                        repo = %self.root.display(),
                        holder = %actor,
                        lock_id = %new.lock_id,
                        reclaimed = current.is_some(),
                        "lock acquired"
                    );
                    self.publish(Some(&new));
                    return Ok(new);
                }
                // Someone else changed the record between load and swap.
                CasOutcome::Conflict { .. } => continue,
            }
        }
    }

    // -----------------------------------------------------------------------
    // release
    // -----------------------------------------------------------------------

    pub fn release(&self, actor: &str, lock_id: &str) -> Result<()> {
        loop {
            let now = self.clock.now();
            let current = self.store.load()?;
            let held = match current {
                None => {
                    self.audit.record(
                        now,
                        AuditOperation::Release,
                        actor,
                        false,
                        format!("refused: lock {lock_id} not found"),
                    )?;
                    return Err(LockError::NotFound.into());
                }
                Some(r) if r.lock_id != lock_id => {
                    self.audit.record(
                        now,
                        AuditOperation::Release,
                        actor,
                        false,
                        format!("refused: lock {lock_id} is not current (held by {})", r.holder),
                    )?;
                    return Err(LockError::NotHolder {
                        lock_id: lock_id.to_string(),
                        holder: r.holder,
                    }
                    .into());
                }
                Some(r) => r,
            };

            let outcome = self.audited_swap(Some(lock_id), None, Some(&held), || {
                self.audit
                    .record(
                        now,
                        AuditOperation::Release,
                        actor,
                        true,
                        format!("lock {lock_id} released"),
                    )
                    .map(|_| ())
            })?;
            if outcome == CasOutcome::Swapped {
                tracing::info!(repo = %self.root.display(), holder = %actor, lock_id, "lock released");
                self.publish(None);
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // renew
    // -----------------------------------------------------------------------

    /// Extend the lock to `now + timeout` on behalf of `actor`. Returns the
    /// new expiry. Refusals are recorded against `actor`, not the holder.
    pub fn renew(&self, actor: &str, lock_id: &str, timeout: Duration) -> Result<DateTime<Utc>> {
        loop {
            let now = self.clock.now();
            let held = match self.store.load()? {
                None => {
                    self.audit.record(
                        now,
                        AuditOperation::Renew,
                        actor,
                        false,
                        format!("refused: lock {lock_id} not found"),
                    )?;
                    return Err(LockError::NotFound.into());
                }
                Some(r) if r.lock_id != lock_id => {
                    self.audit.record(
                        now,
                        AuditOperation::Renew,
                        actor,
                        false,
                        format!("refused: lock {lock_id} is not current"),
                    )?;
                    return Err(LockError::NotHolder {
                        lock_id: lock_id.to_string(),
                        holder: r.holder,
                    }
                    .into());
                }
                Some(r) if r.is_expired(now) => {
                    self.audit.record(
                        now,
                        AuditOperation::Renew,
                        actor,
                        false,
                        format!("refused: lock {lock_id} already expired"),
                    )?;
                    return Err(LockError::Expired {
                        lock_id: lock_id.to_string(),
                        expires_at: r.expires_at,
                    }
                    .into());
                }
                Some(r) => r,
            };

            let renewed = held.renewed(now, timeout);
            let outcome = self.audited_swap(Some(lock_id), Some(&renewed), Some(&held), || {
                self.audit
                    .record(
                        now,
                        AuditOperation::Renew,
                        actor,
                        true,
                        format!(
                            "lock {lock_id} extended to {}",
                            renewed.expires_at.format(TS_FORMAT)
                        ),
                    )
                    .map(|_| ())
            })?;
            if outcome == CasOutcome::Swapped {
                tracing::debug!(
                    repo = %self.root.display(),
                    lock_id,
                    expires_at = %renewed.expires_at,
                    "lock renewed"
                );
                self.publish(Some(&renewed));
                return Ok(renewed.expires_at);
            }
        }
    }

    /// Renew only when less than `threshold` remains. Used by the heartbeat.
    pub fn renew_if_expiring(
        &self,
        actor: &str,
        lock_id: &str,
        timeout: Duration,
        threshold: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        match self.store.load()? {
            Some(r) if r.lock_id == lock_id && r.is_expiring_soon(now, threshold) => {
                self.renew(actor, lock_id, timeout).map(Some)
            }
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // force_break
    // -----------------------------------------------------------------------

    /// Delete the lock regardless of holder. The audit entry naming the
    /// displaced holder (or "none") is written before the record is removed;
    /// if it cannot be written the lock stays in place.
    pub fn force_break(&self, actor: &str, justification: &str) -> Result<Displaced> {
        let now = self.clock.now();
        let displaced = self.store.force_clear(&mut |displaced| {
            let who = match displaced {
                Displaced::None => "none".to_string(),
                Displaced::Record(r) => format!("{} (lock {})", r.holder, r.lock_id),
                Displaced::Unreadable(reason) => format!("unreadable record ({reason})"),
            };
            self.audit
                .record(
                    now,
                    AuditOperation::ForceBreak,
                    actor,
                    true,
                    format!("displaced {who}; justification: {justification}"),
                )
                .map(|_| ())
        })?;
        tracing::warn!(
            repo = %self.root.display(),
            actor = %actor,
            displaced = ?displaced,
            justification = %justification,
            "lock force-broken"
        );
        if displaced != Displaced::None {
            self.publish(None);
        }
        Ok(displaced)
    }

    // -----------------------------------------------------------------------
    // status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Result<LockStatus> {
        let now = self.clock.now();
        Ok(LockStatus::classify(self.store.load()?, now, self.staleness))
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    fn audited_swap(
        &self,
        expected: Option<&str>,
        new: Option<&LockRecord>,
        previous: Option<&LockRecord>,
        write_entry: impl FnOnce() -> Result<()>,
    ) -> Result<CasOutcome> {
        let outcome = self.store.compare_and_swap(expected, new)?;
        if outcome != CasOutcome::Swapped {
            return Ok(outcome);
        }
        if let Err(e) = write_entry() {
            let ours = new.map(|r| r.lock_id.as_str());
            if let Err(rollback) = self.store.compare_and_swap(ours, previous) {
                tracing::error!(
                    repo = %self.root.display(),
                    error = %rollback,
                    "failed to roll back lock transition after audit failure"
                );
            }
            return Err(e);
        }
        Ok(outcome)
    }

    fn publish(&self, record: Option<&LockRecord>) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.publish(&self.root, record) {
                tracing::warn!(repo = %self.root.display(), error = %e, "lock mirror publish failed");
            }
        }
    }
}
