use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

/// The persisted current lock. Absence of a record means unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque token; compare-and-swap keys on it.
    pub lock_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(holder: &str, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + timeout,
            last_renewed_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Held, but not renewed within `window`. Flagged only, never released.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.is_expired(now) && now - self.last_renewed_at > window
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    pub fn is_expiring_soon(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        !self.is_expired(now) && self.remaining(now) <= threshold
    }

    /// A copy extended to `now + timeout`, keeping the same token.
    pub fn renewed(&self, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            expires_at: now + timeout,
            last_renewed_at: now,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// LockStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    Held { lock: LockRecord },
    Stale { lock: LockRecord },
    Expired { lock: LockRecord },
}

impl LockStatus {
    pub fn classify(record: Option<LockRecord>, now: DateTime<Utc>, window: Duration) -> Self {
        match record {
            None => LockStatus::Unlocked,
            Some(lock) if lock.is_expired(now) => LockStatus::Expired { lock },
            Some(lock) if lock.is_stale(now, window) => LockStatus::Stale { lock },
            Some(lock) => LockStatus::Held { lock },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LockStatus::Unlocked => "unlocked",
            LockStatus::Held { .. } => "held",
            LockStatus::Stale { .. } => "stale",
            LockStatus::Expired { .. } => "expired",
        }
    }

    pub fn record(&self) -> Option<&LockRecord> {
        match self {
            LockStatus::Unlocked => None,
            LockStatus::Held { lock } | LockStatus::Stale { lock } | LockStatus::Expired { lock } => {
                Some(lock)
            }
        }
    }
}
