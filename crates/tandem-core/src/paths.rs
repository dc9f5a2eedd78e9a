use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const STATE_DIR: &str = ".tandem";

pub const CONFIG_FILE: &str = ".tandem/config.yaml";
pub const LOCK_FILE: &str = ".tandem/lock.json";
pub const LOCK_GUARD: &str = ".tandem/lock.guard";
pub const AUDIT_FILE: &str = ".tandem/audit.jsonl";
pub const QUEUE_FILE: &str = ".tandem/queue.json";
pub const QUEUE_GUARD: &str = ".tandem/queue.guard";
pub const LEASE_DIR: &str = ".tandem/leases";
pub const ENGINE_GUARD: &str = ".tandem/engine.guard";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn state_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn lock_guard_path(root: &Path) -> PathBuf {
    root.join(LOCK_GUARD)
}

pub fn audit_path(root: &Path) -> PathBuf {
    root.join(AUDIT_FILE)
}

pub fn queue_path(root: &Path) -> PathBuf {
    root.join(QUEUE_FILE)
}

pub fn queue_guard_path(root: &Path) -> PathBuf {
    root.join(QUEUE_GUARD)
}

/// Liveness file held locked by the queue handle that owns `owner`'s claims.
pub fn lease_path(root: &Path, owner: &str) -> PathBuf {
    root.join(LEASE_DIR).join(format!("{owner}.lease"))
}

pub fn engine_guard_path(root: &Path) -> PathBuf {
    root.join(ENGINE_GUARD)
}

/// Metadata directories written by the VCS engines themselves.
pub const ENGINE_DIRS: &[&str] = &[".oxen", ".git"];

/// True for paths inside `.tandem/` or an engine metadata directory.
/// Changes there are bookkeeping, not project edits.
pub fn is_internal(root: &Path, path: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    rel.components().next().is_some_and(|first| {
        let name = first.as_os_str();
        name == STATE_DIR || ENGINE_DIRS.iter().any(|d| name == *d)
    })
}

// ---------------------------------------------------------------------------
// Branch name validation
// ---------------------------------------------------------------------------

static BRANCH_RE: OnceLock<Regex> = OnceLock::new();

fn branch_re() -> &'static Regex {
    BRANCH_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/\-]*$").expect("branch regex is valid")
    })
}

pub fn is_valid_branch(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && branch_re().is_match(name)
        && !name.contains("..")
        && !name.ends_with('/')
        && !name.ends_with(".lock")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
