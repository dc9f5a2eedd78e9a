use std::path::{Path, PathBuf};
use tandem_core::paths;

/// Resolve the repository root.
///
/// Priority:
/// 1. `--root` flag / `TANDEM_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.tandem/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_state_root(&cwd).unwrap_or(cwd)
}

fn find_state_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| paths::state_dir(dir).is_dir())
        .map(Path::to_path_buf)
}

/// Fail with a hint when `tandem init` has not been run in `root`.
pub fn require_initialized(root: &Path) -> anyhow::Result<()> {
    if paths::state_dir(root).is_dir() {
        Ok(())
    } else {
        Err(tandem_core::TandemError::NotInitialized(root.to_path_buf()).into())
    }
}
