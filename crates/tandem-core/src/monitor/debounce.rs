use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Coalesced changes for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBurst {
    pub first_event_at: Instant,
    pub last_event_at: Instant,
    pub affected_paths: BTreeSet<PathBuf>,
    pub open: bool,
}

impl ChangeBurst {
    fn start(path: PathBuf, at: Instant) -> Self {
        Self {
            first_event_at: at,
            last_event_at: at,
            affected_paths: BTreeSet::from([path]),
            open: true,
        }
    }

    pub fn deadline(&self, interval: Duration) -> Instant {
        self.last_event_at + interval
    }
}

/// Per-repository debounce state: `Idle → Open{deadline} → Closed → Idle`.
///
/// Pure bookkeeping; the caller owns the clock and the timer. Every burst
/// leaves through exactly one of `poll_expired`, `preempt` or `discard`, and
/// each of those removes it, so a burst is closed at most once.
#[derive(Debug)]
pub struct Debouncer {
    interval: Duration,
    bursts: BTreeMap<PathBuf, ChangeBurst>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            bursts: BTreeMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a change under `repo`. Opens a burst when idle, otherwise adds
    /// the path and pushes the deadline out. Returns true if a burst opened.
    pub fn record(&mut self, repo: &Path, path: PathBuf, at: Instant) -> bool {
        match self.bursts.get_mut(repo) {
            Some(burst) => {
                burst.affected_paths.insert(path);
                burst.last_event_at = burst.last_event_at.max(at);
                false
            }
            None => {
                self.bursts
                    .insert(repo.to_path_buf(), ChangeBurst::start(path, at));
                true
            }
        }
    }

    pub fn is_open(&self, repo: &Path) -> bool {
        self.bursts.contains_key(repo)
    }

    pub fn deadline(&self, repo: &Path) -> Option<Instant> {
        self.bursts.get(repo).map(|b| b.deadline(self.interval))
    }

    /// Earliest deadline across all open bursts.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.bursts
            .values()
            .map(|b| b.deadline(self.interval))
            .min()
    }

    /// Close and return every burst whose deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<(PathBuf, ChangeBurst)> {
        let due: Vec<PathBuf> = self
            .bursts
            .iter()
            .filter(|(_, b)| b.deadline(self.interval) <= now)
            .map(|(repo, _)| repo.clone())
            .collect();
        due.into_iter()
            .filter_map(|repo| self.close(&repo).map(|b| (repo, b)))
            .collect()
    }

    /// Close every open burst now, regardless of deadline.
    pub fn preempt(&mut self) -> Vec<(PathBuf, ChangeBurst)> {
        let repos: Vec<PathBuf> = self.bursts.keys().cloned().collect();
        repos
            .into_iter()
            .filter_map(|repo| self.close(&repo).map(|b| (repo, b)))
            .collect()
    }

    /// Drop a burst without closing it.
    pub fn discard(&mut self, repo: &Path) -> Option<ChangeBurst> {
        self.bursts.remove(repo)
    }

    pub fn open_bursts(&self) -> impl Iterator<Item = (&PathBuf, &ChangeBurst)> {
        self.bursts.iter()
    }

    fn close(&mut self, repo: &Path) -> Option<ChangeBurst> {
        self.bursts.remove(repo).map(|mut b| {
            b.open = false;
            b
        })
    }
}
