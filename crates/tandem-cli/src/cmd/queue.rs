use crate::cmd::{block_on, engine};
use crate::output::{print_json, print_table, short_time};
use crate::root::require_initialized;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::sync::Arc;
use tandem_core::config::Config;
use tandem_core::resilience::{EngineExecutor, OfflineQueue, QueueDrainer, Resilience};

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queued operations, oldest first
    List,

    /// Count entries by state
    Stats,

    /// Deliver queued operations now
    Drain {
        /// Return interrupted (in-flight) entries to pending first. Entries
        /// still claimed by a running `tandem watch` are left alone.
        #[arg(long)]
        recover: bool,
    },

    /// Delete entries that failed permanently
    Purge,
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    require_initialized(root)?;
    let queue = OfflineQueue::new(root);
    match subcmd {
        QueueSubcommand::List => list(&queue, json),
        QueueSubcommand::Stats => {
            let stats = queue.stats().context("failed to read queue")?;
            if json {
                print_json(&stats)
            } else {
                println!(
                    "pending: {}  in-flight: {}  failed: {}  total: {}",
                    stats.pending, stats.in_flight, stats.failed, stats.total
                );
                Ok(())
            }
        }
        QueueSubcommand::Drain { recover } => drain(root, &queue, recover, json),
        QueueSubcommand::Purge => {
            let removed = queue.purge_failed().context("failed to purge queue")?;
            if json {
                print_json(&serde_json::json!({ "purged": removed }))
            } else {
                println!("Purged {removed} failed entr{}.", if removed == 1 { "y" } else { "ies" });
                Ok(())
            }
        }
    }
}

fn list(queue: &OfflineQueue, json: bool) -> anyhow::Result<()> {
    let entries = queue.list().context("failed to read queue")?;
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("Offline queue is empty.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.id.to_string(),
                e.status.label().to_string(),
                e.operation.label(),
                e.attempts.to_string(),
                short_time(&e.enqueued_at),
                e.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(
        &["ID", "STATE", "OPERATION", "ATTEMPTS", "ENQUEUED", "LAST ERROR"],
        rows,
    );
    Ok(())
}

fn drain(root: &Path, queue: &OfflineQueue, recover: bool, json: bool) -> anyhow::Result<()> {
    if recover {
        let recovered = queue.startup_recovery().context("failed to recover queue")?;
        if recovered > 0 && !json {
            println!("Returned {recovered} interrupted entr{} to pending.", if recovered == 1 { "y" } else { "ies" });
        }
    }
    let config = Config::load(root).context("failed to load config")?;
    let drainer = QueueDrainer::new(
        Arc::new(Resilience::from_config(&config)),
        Arc::new(EngineExecutor::new(engine(&config)?)),
    );
    let report = block_on(drainer.drain_once(queue))?.context("queue drain failed")?;
    if json {
        return print_json(&report);
    }
    println!(
        "delivered: {}  failed: {}{}",
        report.delivered,
        report.failed,
        if report.deferred { "  (remote unavailable, rest deferred)" } else { "" }
    );
    Ok(())
}
