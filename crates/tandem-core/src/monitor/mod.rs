//! Change monitor.
//!
//! A single task owns the [`Debouncer`] for every registered repository.
//! Raw file events arrive over a bounded channel (OS callback threads use
//! `blocking_send`), control commands over a second one. Because only this
//! task touches debounce state, deadline resets are serialized, and a
//! power preemption can never race a natural closure: whichever message the
//! task handles first closes the burst, the other finds nothing open.

pub mod debounce;

pub use debounce::{ChangeBurst, Debouncer};

use crate::error::{Result, TandemError};
use crate::orchestrator::{CommitIntent, Trigger};
use crate::paths;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// FileEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// An open burst as seen from outside the monitor task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstSnapshot {
    pub repo: PathBuf,
    pub affected_paths: Vec<PathBuf>,
    pub remaining: Duration,
}

// ---------------------------------------------------------------------------
// Settings / commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub debounce: Duration,
    pub channel_capacity: usize,
    pub draft_branch: String,
}

#[derive(Debug)]
enum Command {
    Register {
        repo: PathBuf,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        repo: PathBuf,
        reply: oneshot::Sender<bool>,
    },
    Preempt {
        trigger: Trigger,
        reply: oneshot::Sender<Vec<CommitIntent>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<BurstSnapshot>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// MonitorHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorHandle {
    events: mpsc::Sender<FileEvent>,
    commands: mpsc::Sender<Command>,
}

impl MonitorHandle {
    /// Sender for raw file events. OS callback threads call `blocking_send`.
    pub fn events(&self) -> mpsc::Sender<FileEvent> {
        self.events.clone()
    }

    pub async fn register(&self, repo: &Path) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            repo: repo.to_path_buf(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TandemError::RuntimeStopped)
    }

    /// Stop watching `repo`. An open burst is dropped without an intent.
    /// Returns whether the repository was registered.
    pub async fn unregister(&self, repo: &Path) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unregister {
            repo: repo.to_path_buf(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| TandemError::RuntimeStopped)
    }

    /// Close every open burst immediately and return one Emergency intent per
    /// burst. Bypasses the intent channel so it never queues behind drafts.
    pub async fn preempt(&self, trigger: Trigger) -> Result<Vec<CommitIntent>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Preempt { trigger, reply }).await?;
        rx.await.map_err(|_| TandemError::RuntimeStopped)
    }

    pub async fn snapshot(&self) -> Result<Vec<BurstSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| TandemError::RuntimeStopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Feed an upstream event source into the monitor until it ends or the
    /// monitor stops.
    pub async fn forward<S>(&self, stream: S)
    where
        S: Stream<Item = FileEvent> + Send,
    {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if self.events.send(event).await.is_err() {
                break;
            }
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TandemError::RuntimeStopped)
    }
}

// ---------------------------------------------------------------------------
// ChangeMonitor
// ---------------------------------------------------------------------------

pub struct ChangeMonitor {
    settings: MonitorSettings,
    debouncer: Debouncer,
    repos: BTreeSet<PathBuf>,
    intents: mpsc::Sender<CommitIntent>,
}

impl ChangeMonitor {
    /// Spawn the monitor task. Draft intents for closed bursts go to `intents`.
    pub fn spawn(
        settings: MonitorSettings,
        intents: mpsc::Sender<CommitIntent>,
    ) -> (MonitorHandle, JoinHandle<()>) {
        let capacity = settings.channel_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let monitor = ChangeMonitor {
            debouncer: Debouncer::new(settings.debounce),
            settings,
            repos: BTreeSet::new(),
            intents,
        };
        let task = tokio::spawn(monitor.run(events_rx, commands_rx));
        (
            MonitorHandle {
                events: events_tx,
                commands: commands_tx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut events: mpsc::Receiver<FileEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        let mut events_open = true;
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => {
                        // Commands observe every event queued before them,
                        // and no burst whose deadline already passed.
                        self.close_expired().await;
                        if events_open {
                            events_open = self.drain_events(&mut events);
                        }
                        self.handle_command(cmd);
                    }
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        // This arm wins ties with the timer; a burst past its
                        // deadline closes before the event can extend it.
                        self.close_expired().await;
                        self.handle_event(event);
                    }
                    None => events_open = false,
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    self.close_expired().await;
                }
            }
        }
        let open = self.debouncer.open_bursts().count();
        if open > 0 {
            tracing::warn!(open, "change monitor stopped with open bursts");
        }
        tracing::debug!("change monitor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register { repo, reply } => {
                tracing::info!(repo = %repo.display(), "watching repository");
                self.repos.insert(repo);
                let _ = reply.send(());
            }
            Command::Unregister { repo, reply } => {
                let known = self.repos.remove(&repo);
                if let Some(burst) = self.debouncer.discard(&repo) {
                    tracing::info!(
                        repo = %repo.display(),
                        paths = burst.affected_paths.len(),
                        "unregistered mid-burst, discarding pending changes"
                    );
                }
                let _ = reply.send(known);
            }
            Command::Preempt { trigger, reply } => {
                let intents: Vec<CommitIntent> = self
                    .debouncer
                    .preempt()
                    .into_iter()
                    .map(|(repo, burst)| {
                        tracing::warn!(
                            repo = %repo.display(),
                            paths = burst.affected_paths.len(),
                            %trigger,
                            "burst preempted"
                        );
                        CommitIntent::emergency(
                            repo,
                            &self.settings.draft_branch,
                            trigger.clone(),
                            burst.affected_paths.into_iter().collect(),
                        )
                    })
                    .collect();
                let _ = reply.send(intents);
            }
            Command::Snapshot { reply } => {
                let now = Instant::now();
                let snapshot = self
                    .debouncer
                    .open_bursts()
                    .map(|(repo, burst)| BurstSnapshot {
                        repo: repo.clone(),
                        affected_paths: burst.affected_paths.iter().cloned().collect(),
                        remaining: burst
                            .deadline(self.debouncer.interval())
                            .saturating_duration_since(now),
                    })
                    .collect();
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    /// Apply every event already in the channel. Returns false once the
    /// sending side has closed.
    fn drain_events(&mut self, events: &mut mpsc::Receiver<FileEvent>) -> bool {
        loop {
            match events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_event(&mut self, event: FileEvent) {
        let Some(repo) = self.owning_repo(&event.path) else {
            return;
        };
        if paths::is_internal(&repo, &event.path) {
            return;
        }
        let rel = event
            .path
            .strip_prefix(&repo)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| event.path.clone());
        if self.debouncer.record(&repo, rel, Instant::now()) {
            tracing::debug!(repo = %repo.display(), kind = ?event.kind, "burst opened");
        }
    }

    async fn close_expired(&mut self) {
        for (repo, burst) in self.debouncer.poll_expired(Instant::now()) {
            let intent = CommitIntent::draft(
                repo.clone(),
                &self.settings.draft_branch,
                burst.affected_paths.into_iter().collect(),
            );
            tracing::info!(
                repo = %repo.display(),
                paths = intent.affected_paths.len(),
                "burst closed, requesting draft commit"
            );
            if self.intents.send(intent).await.is_err() {
                tracing::warn!(repo = %repo.display(), "orchestrator gone, dropping draft intent");
            }
        }
    }

    /// The most specific registered repository containing `path`.
    fn owning_repo(&self, path: &Path) -> Option<PathBuf> {
        self.repos
            .iter()
            .filter(|repo| path.starts_with(repo))
            .max_by_key(|repo| repo.components().count())
            .cloned()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::CommitKind;
    use crate::power::PowerSignalKind;

    fn settings(debounce: u64) -> MonitorSettings {
        MonitorSettings {
            debounce: Duration::from_secs(debounce),
            channel_capacity: 16,
            draft_branch: "draft".into(),
        }
    }

    fn modified(path: &str) -> FileEvent {
        FileEvent::new(path, ChangeKind::Modified)
    }

    #[tokio::test(start_paused = true)]
    async fn events_at_0_10_20_close_at_50() {
        let (intent_tx, mut intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(30), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();
        let events = monitor.events();
        let start = Instant::now();

        events.send(modified("/song/a.wav")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(modified("/song/b.wav")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        events.send(modified("/song/a.wav")).await.unwrap();

        // Nothing at t=30, the old deadline.
        assert!(
            tokio::time::timeout(Duration::from_secs(29), intents.recv())
                .await
                .is_err()
        );
        let intent = intents.recv().await.unwrap();
        let closed_at = start.elapsed();
        assert!(closed_at >= Duration::from_secs(50), "{closed_at:?}");
        assert!(closed_at < Duration::from_secs(51), "{closed_at:?}");
        assert_eq!(intent.kind, CommitKind::Draft);
        assert_eq!(intent.target_branch, "draft");
        assert_eq!(
            intent.affected_paths,
            vec![PathBuf::from("a.wav"), PathBuf::from("b.wav")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn event_after_elapsed_deadline_opens_new_burst() {
        let (intent_tx, mut intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(30), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();
        let events = monitor.events();
        events.send(modified("/song/a.wav")).await.unwrap();
        assert_eq!(monitor.snapshot().await.unwrap().len(), 1);

        // The next event is already waiting when the monitor wakes past the
        // deadline, so both of its select arms are ready at once.
        events.try_send(modified("/song/b.wav")).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        let first = intents.recv().await.unwrap();
        assert_eq!(first.affected_paths, vec![PathBuf::from("a.wav")]);
        let second = intents.recv().await.unwrap();
        assert_eq!(second.affected_paths, vec![PathBuf::from("b.wav")]);
    }

    #[tokio::test(start_paused = true)]
    async fn preempt_emits_emergency_before_deadline_and_no_draft() {
        let (intent_tx, mut intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(15), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();
        let start = Instant::now();
        monitor.events().send(modified("/song/mix.als")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let emergency = monitor
            .preempt(Trigger::Power(PowerSignalKind::WillSleep))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(15));
        assert_eq!(emergency.len(), 1);
        assert_eq!(emergency[0].kind, CommitKind::Emergency);
        assert_eq!(emergency[0].target_branch, "draft");

        assert!(
            tokio::time::timeout(Duration::from_secs(60), intents.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_mid_burst_discards_silently() {
        let (intent_tx, mut intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(30), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();
        monitor.events().send(modified("/song/kick.wav")).await.unwrap();
        assert_eq!(monitor.snapshot().await.unwrap().len(), 1);

        assert!(monitor.unregister(Path::new("/song")).await.unwrap());
        assert!(monitor.snapshot().await.unwrap().is_empty());
        assert!(
            tokio::time::timeout(Duration::from_secs(120), intents.recv())
                .await
                .is_err()
        );
        // Events for an unregistered path are ignored.
        monitor.events().send(modified("/song/kick.wav")).await.unwrap();
        assert!(monitor.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn internal_and_foreign_paths_are_ignored() {
        let (intent_tx, _intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(30), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();
        let events = monitor.events();
        events.send(modified("/song/.tandem/lock.json")).await.unwrap();
        events.send(modified("/elsewhere/file.wav")).await.unwrap();
        assert!(monitor.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forward_consumes_a_stream() {
        let (intent_tx, mut intents) = mpsc::channel(8);
        let (monitor, _task) = ChangeMonitor::spawn(settings(30), intent_tx);
        monitor.register(Path::new("/song")).await.unwrap();

        let stream = futures::stream::iter(vec![
            modified("/song/a.wav"),
            modified("/song/b.wav"),
        ]);
        monitor.forward(stream).await;

        let intent = intents.recv().await.unwrap();
        assert_eq!(intent.affected_paths.len(), 2);
        monitor.shutdown().await;
    }
}
