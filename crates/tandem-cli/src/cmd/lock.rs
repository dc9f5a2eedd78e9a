use crate::output::{print_json, short_time};
use crate::root::require_initialized;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::sync::Arc;
use tandem_core::clock::SystemClock;
use tandem_core::config::Config;
use tandem_core::lock::{Displaced, LockManager, LockStatus, QueuedMirror};
use tandem_core::resilience::OfflineQueue;

#[derive(Subcommand)]
pub enum LockSubcommand {
    /// Take the exclusive editing lock
    Acquire {
        /// Lock lifetime in hours (default: lock.default_timeout_hours)
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Give the lock back
    Release {
        /// Lock id (default: the lock you currently hold)
        lock_id: Option<String>,
    },

    /// Extend the lock you hold
    Renew {
        /// Lock id (default: the lock you currently hold)
        lock_id: Option<String>,
        /// New lifetime in hours from now
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Remove the lock regardless of holder (audited)
    Break {
        /// Why the lock is being broken; recorded in the audit log
        #[arg(long)]
        reason: String,
    },

    /// Show who holds the lock
    Status,
}

pub fn run(root: &Path, actor: &str, subcmd: LockSubcommand, json: bool) -> anyhow::Result<()> {
    require_initialized(root)?;
    let config = Config::load(root).context("failed to load config")?;
    let mut manager = LockManager::new(
        root,
        Arc::new(SystemClock),
        config.lock.staleness_window(),
    );
    if config.engine.mirror_locks {
        manager = manager.with_mirror(Arc::new(QueuedMirror::new(OfflineQueue::new(root))));
    }
    let timeout = |hours: Option<i64>| {
        hours.map_or_else(|| config.lock.default_timeout(), chrono::Duration::hours)
    };

    match subcmd {
        LockSubcommand::Acquire { hours } => {
            let record = manager.acquire(actor, timeout(hours))?;
            if json {
                print_json(&record)?;
            } else {
                println!(
                    "Lock acquired by {} until {}",
                    record.holder,
                    short_time(&record.expires_at)
                );
                println!("  id: {}", record.lock_id);
            }
        }
        LockSubcommand::Release { lock_id } => {
            let lock_id = resolve_lock_id(&manager, actor, lock_id)?;
            manager.release(actor, &lock_id)?;
            if json {
                print_json(&serde_json::json!({ "released": lock_id }))?;
            } else {
                println!("Lock {lock_id} released.");
            }
        }
        LockSubcommand::Renew { lock_id, hours } => {
            let lock_id = resolve_lock_id(&manager, actor, lock_id)?;
            let expires_at = manager.renew(actor, &lock_id, timeout(hours))?;
            if json {
                print_json(&serde_json::json!({ "lock_id": lock_id, "expires_at": expires_at }))?;
            } else {
                println!("Lock {lock_id} renewed until {}", short_time(&expires_at));
            }
        }
        LockSubcommand::Break { reason } => {
            let displaced = manager.force_break(actor, &reason)?;
            let (holder, lock_id) = match &displaced {
                Displaced::None => (None, None),
                Displaced::Record(r) => (Some(r.holder.clone()), Some(r.lock_id.clone())),
                Displaced::Unreadable(_) => (None, None),
            };
            if json {
                print_json(&serde_json::json!({
                    "broken": displaced != Displaced::None,
                    "displaced_holder": holder,
                    "displaced_lock_id": lock_id,
                }))?;
            } else {
                match displaced {
                    Displaced::None => println!("No lock was held; break recorded."),
                    Displaced::Record(r) => {
                        println!("Lock held by {} broken. This was recorded in the audit log.", r.holder)
                    }
                    Displaced::Unreadable(reason) => {
                        println!("Unreadable lock record removed ({reason}).")
                    }
                }
            }
        }
        LockSubcommand::Status => {
            let status = manager.status()?;
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
    }
    Ok(())
}

fn resolve_lock_id(
    manager: &LockManager,
    actor: &str,
    explicit: Option<String>,
) -> anyhow::Result<String> {
    if let Some(id) = explicit {
        return Ok(id);
    }
    match manager.status()?.record() {
        Some(r) if r.holder == actor => Ok(r.lock_id.clone()),
        Some(r) => anyhow::bail!(
            "the lock is held by {}, not {actor}; pass the lock id explicitly",
            r.holder
        ),
        None => anyhow::bail!("no lock is held"),
    }
}

fn print_status(status: &LockStatus) {
    match status {
        LockStatus::Unlocked => println!("unlocked"),
        LockStatus::Held { lock } => println!(
            "held by {} until {} (id {})",
            lock.holder,
            short_time(&lock.expires_at),
            lock.lock_id
        ),
        LockStatus::Stale { lock } => println!(
            "stale: held by {} until {}, not renewed since {}",
            lock.holder,
            short_time(&lock.expires_at),
            short_time(&lock.last_renewed_at)
        ),
        LockStatus::Expired { lock } => println!(
            "expired: {} held it until {}; anyone may acquire",
            lock.holder,
            short_time(&lock.expires_at)
        ),
    }
}
