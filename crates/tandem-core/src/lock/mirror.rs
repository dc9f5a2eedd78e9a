use super::record::LockRecord;
use crate::error::Result;
use crate::resilience::{OfflineQueue, Operation};
use std::fmt::Debug;
use std::path::Path;

/// Publishes lock transitions for remote observers that poll.
///
/// Advisory only: acquisition is decided by the local compare-and-swap, never
/// by what a mirror reports.
pub trait LockMirror: Send + Sync + Debug {
    fn publish(&self, repo: &Path, record: Option<&LockRecord>) -> Result<()>;
}

/// Routes each transition through the offline queue so it reaches the remote
/// via the retry and circuit-breaker path, surviving outages and restarts.
#[derive(Debug, Clone)]
pub struct QueuedMirror {
    queue: OfflineQueue,
}

impl QueuedMirror {
    pub fn new(queue: OfflineQueue) -> Self {
        Self { queue }
    }
}

impl LockMirror for QueuedMirror {
    fn publish(&self, _repo: &Path, record: Option<&LockRecord>) -> Result<()> {
        let entry = self.queue.enqueue(Operation::MirrorLock {
            record: record.cloned(),
        })?;
        tracing::debug!(id = %entry.id, "lock transition queued for mirroring");
        Ok(())
    }
}
