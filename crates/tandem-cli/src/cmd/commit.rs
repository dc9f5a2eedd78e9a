use crate::cmd::{block_on, engine};
use crate::output::print_json;
use crate::root::require_initialized;
use anyhow::Context;
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use tandem_core::clock::SystemClock;
use tandem_core::config::Config;
use tandem_core::lock::LockManager;
use tandem_core::orchestrator::{CommitOrchestrator, CommitOutcome, MilestoneMetadata};
use tandem_core::resilience::{EngineExecutor, Resilience};

#[derive(Args)]
pub struct CommitArgs {
    /// Commit message
    #[arg(long, short = 'm')]
    message: String,

    /// Project tempo
    #[arg(long)]
    bpm: Option<f32>,

    /// Project sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Musical key (e.g. "A minor")
    #[arg(long)]
    key: Option<String>,

    /// Tag for the milestone (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Push the working branch afterwards
    #[arg(long)]
    push: bool,
}

pub fn run(root: &Path, actor: &str, args: CommitArgs, json: bool) -> anyhow::Result<()> {
    require_initialized(root)?;
    let config = Config::load(root).context("failed to load config")?;
    warn_if_locked_by_other(root, actor, &config);

    let orchestrator = CommitOrchestrator::new(
        Arc::new(Resilience::from_config(&config)),
        Arc::new(EngineExecutor::new(engine(&config)?)),
        Arc::new(SystemClock),
        actor,
        config.branches.clone(),
    )
    .with_push_after_commit(args.push || config.engine.push_after_commit);

    let metadata = MilestoneMetadata {
        message: args.message,
        tempo_bpm: args.bpm,
        sample_rate_hz: args.sample_rate,
        key_signature: args.key,
        tags: args.tags,
    };
    let outcome = block_on(orchestrator.commit_now(root, metadata))?
        .context("milestone commit failed")?;

    if json {
        return print_json(&outcome);
    }
    match outcome {
        CommitOutcome::Committed { commit_id, branch } => {
            println!("Committed {commit_id} to {branch}.")
        }
        CommitOutcome::NothingToCommit => println!("Nothing to commit; working tree unchanged."),
    }
    Ok(())
}

fn warn_if_locked_by_other(root: &Path, actor: &str, config: &Config) {
    let manager = LockManager::new(root, Arc::new(SystemClock), config.lock.staleness_window());
    if let Ok(status) = manager.status() {
        if let Some(lock) = status.record().filter(|l| l.holder != actor) {
            eprintln!(
                "warning: the lock is held by {}; committing anyway",
                lock.holder
            );
        }
    }
}
