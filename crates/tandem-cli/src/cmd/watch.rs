use crate::cmd::engine;
use crate::root::require_initialized;
use anyhow::Context;
use clap::Args;
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_core::clock::SystemClock;
use tandem_core::config::Config;
use tandem_core::engine::VcsEngine;
use tandem_core::monitor::{ChangeKind, FileEvent};
use tandem_core::power::{PowerSignal, PowerSignalKind};
use tandem_core::runtime::RuntimeHandle;
use tokio::sync::mpsc;

#[derive(Args)]
pub struct WatchArgs {
    /// Acquire the lock on start, keep it renewed, release it on exit
    #[arg(long)]
    hold_lock: bool,

    /// Override monitor.debounce_secs
    #[arg(long, value_name = "SECS")]
    debounce: Option<u64>,
}

pub fn run(root: &Path, actor: &str, args: WatchArgs) -> anyhow::Result<()> {
    require_initialized(root)?;
    // Watcher events carry absolute paths.
    let root = std::fs::canonicalize(root)
        .with_context(|| format!("failed to resolve {}", root.display()))?;
    let mut config = Config::load(&root).context("failed to load config")?;
    if let Some(secs) = args.debounce {
        config.monitor.debounce_secs = secs;
    }
    if args.hold_lock {
        config.lock.auto_renew = true;
    }
    let engine = engine(&config)?;

    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    rt.block_on(serve(root, actor, config, engine, args.hold_lock))
}

async fn serve(
    root: PathBuf,
    actor: &str,
    config: Config,
    engine: Arc<dyn VcsEngine>,
    hold_lock: bool,
) -> anyhow::Result<()> {
    let debounce = config.monitor.debounce_secs;
    let runtime = RuntimeHandle::start(config, actor, engine, Arc::new(SystemClock));
    runtime
        .register_path(&root)
        .await
        .context("failed to register repository")?;

    let lock = if hold_lock {
        let record = runtime
            .acquire_lock(&root, None)
            .context("cannot hold the lock")?;
        tracing::info!(lock_id = %record.lock_id, expires_at = %record.expires_at, "lock acquired");
        Some(record)
    } else {
        None
    };

    let _watcher = spawn_watcher(&root, runtime.file_events())?;
    tracing::info!(repo = %root.display(), debounce_secs = debounce, "watching; Ctrl-C to stop");

    wait_for_stop().await?;

    // Stopping the daemon is treated like an imminent power-off: whatever is
    // still settling gets an emergency commit before the process exits.
    tracing::warn!("stop requested, committing open changes");
    let report = runtime
        .power_event(PowerSignal::new(PowerSignalKind::WillPowerOff))
        .await;
    if report.timed_out > 0 || report.failed > 0 {
        tracing::error!(
            failed = report.failed,
            timed_out = report.timed_out,
            "some emergency commits did not complete; see the audit log"
        );
    }

    if let Some(lock) = lock {
        if let Err(e) = runtime.release_lock(&root, &lock.lock_id) {
            tracing::warn!(error = %e, "could not release lock on exit");
        }
    }
    runtime.shutdown().await;
    Ok(())
}

fn spawn_watcher(
    root: &Path,
    events: mpsc::Sender<FileEvent>,
) -> anyhow::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let Some(kind) = change_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    // Runs on the watcher's own thread, so blocking is fine.
                    if events.blocking_send(FileEvent::new(path, kind)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "file watcher error"),
        }
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    Ok(watcher)
}

fn change_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

#[cfg(unix)]
async fn wait_for_stop() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for Ctrl-C")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_stop() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind, RenameMode};

    #[test]
    fn notify_kinds_map_to_change_kinds() {
        assert_eq!(
            change_kind(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(ChangeKind::Renamed)
        );
        assert_eq!(
            change_kind(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Removed)
        );
        assert_eq!(
            change_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))),
            None
        );
        assert_eq!(change_kind(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }
}
