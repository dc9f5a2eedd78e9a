use crate::error::Result;
use fs2::FileExt;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// The data is flushed to disk before the rename, so an unclean exit leaves
/// either the old or the new content, never a torn file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create a directory and all parents, idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

/// Write a file only if it does not already exist. Returns true if written.
pub fn write_if_missing(path: &Path, data: &[u8]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    atomic_write(path, data)?;
    Ok(true)
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Append one line to a file and sync it before returning.
///
/// The line is written with a single `write_all` on an `O_APPEND` handle so
/// concurrent appenders never interleave within a line.
pub fn append_line_synced(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut buf = String::with_capacity(line.len() + 1);
    buf.push_str(line);
    buf.push('\n');
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(buf.as_bytes())?;
    f.sync_data()?;
    Ok(())
}

/// Run `f` while holding an exclusive advisory lock on `guard`.
///
/// The guard file is created on first use and never removed. The lock is held
/// per open file description, so it excludes other processes as well as other
/// handles within this process.
pub fn with_exclusive<T>(guard: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = guard.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(guard)?;
    file.lock_exclusive()?;
    let out = f();
    FileExt::unlock(&file)?;
    out
}

/// Add `entry` to `root/<ignore_file>` if it isn't already present.
///
/// Checks for an exact line match. Appends with a leading newline separator
/// if the file doesn't already end with one.
pub fn ensure_ignore_entry(root: &Path, ignore_file: &str, entry: &str) -> Result<()> {
    let path = root.join(ignore_file);
    let existing = read_optional(&path)?.unwrap_or_default();
    if existing.lines().any(|l| l == entry) {
        return Ok(());
    }
    let sep = if existing.is_empty() || existing.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(f, "{sep}{entry}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/lock.json");
        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }

    #[test]
    fn read_optional_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn append_line_synced_appends_newline_terminated_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        append_line_synced(&path, "one").unwrap();
        append_line_synced(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn with_exclusive_serializes_read_modify_write() {
        let dir = TempDir::new().unwrap();
        let counter = dir.path().join("counter");
        let guard = dir.path().join("counter.guard");
        std::fs::write(&counter, "0").unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                let guard = guard.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        with_exclusive(&guard, || {
                            let n: u32 = std::fs::read_to_string(&counter)?.parse().unwrap();
                            atomic_write(&counter, (n + 1).to_string().as_bytes())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(std::fs::read_to_string(&counter).unwrap(), "80");
    }

    #[test]
    fn ensure_ignore_entry_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "node_modules").unwrap();
        ensure_ignore_entry(dir.path(), ".gitignore", ".tandem/").unwrap();
        ensure_ignore_entry(dir.path(), ".gitignore", ".tandem/").unwrap();
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "node_modules\n.tandem/\n");
    }

    #[test]
    fn write_if_missing_skips_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, b"original").unwrap();
        assert!(!write_if_missing(&path, b"new").unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }
}
