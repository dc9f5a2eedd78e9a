#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tandem(dir: &TempDir, actor: &str) -> Command {
    let mut cmd = Command::cargo_bin("tandem").unwrap();
    cmd.current_dir(dir.path())
        .env("TANDEM_ROOT", dir.path())
        .env("TANDEM_ACTOR", actor)
        .env_remove("RUST_LOG");
    cmd
}

fn init_repo(dir: &TempDir) {
    tandem(dir, "alice").arg("init").assert().success();
}

fn json_out(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).unwrap()
}

// ---------------------------------------------------------------------------
// tandem init
// ---------------------------------------------------------------------------

#[test]
fn init_creates_state_and_ignore_entry() {
    let dir = TempDir::new().unwrap();
    tandem(&dir, "alice")
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("created: .tandem/config.yaml"));

    assert!(dir.path().join(".tandem").is_dir());
    assert!(dir.path().join(".tandem/config.yaml").exists());
    let ignore = std::fs::read_to_string(dir.path().join(".oxenignore")).unwrap();
    assert!(ignore.lines().any(|l| l == ".tandem/"));
}

#[test]
fn init_is_idempotent() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    tandem(&dir, "alice")
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("exists:"));

    let ignore = std::fs::read_to_string(dir.path().join(".oxenignore")).unwrap();
    assert_eq!(ignore.matches(".tandem/").count(), 1);
}

#[test]
fn init_with_git_engine_uses_gitignore() {
    let dir = TempDir::new().unwrap();
    tandem(&dir, "alice")
        .args(["init", "--engine", "git"])
        .assert()
        .success();
    assert!(dir.path().join(".gitignore").exists());
    let config = std::fs::read_to_string(dir.path().join(".tandem/config.yaml")).unwrap();
    assert!(config.contains("program: git"));
}

// ---------------------------------------------------------------------------
// tandem lock
// ---------------------------------------------------------------------------

#[test]
fn lock_requires_init() {
    let dir = TempDir::new().unwrap();
    tandem(&dir, "alice")
        .args(["lock", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tandem init"));
}

#[test]
fn lock_acquire_status_release() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);

    let record = json_out(tandem(&dir, "alice").args(["lock", "acquire", "--hours", "2"]));
    assert_eq!(record["holder"], "alice");
    let lock_id = record["lock_id"].as_str().unwrap().to_string();

    let status = json_out(tandem(&dir, "bob").args(["lock", "status"]));
    assert_eq!(status["state"], "held");
    assert_eq!(status["lock"]["lock_id"], lock_id.as_str());

    tandem(&dir, "alice")
        .args(["lock", "release"])
        .assert()
        .success()
        .stdout(predicate::str::contains(lock_id.as_str()));

    tandem(&dir, "bob")
        .args(["lock", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unlocked"));
}

#[test]
fn second_actor_is_refused() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    tandem(&dir, "alice")
        .args(["lock", "acquire"])
        .assert()
        .success();

    tandem(&dir, "bob")
        .args(["lock", "acquire"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lock held by alice"));

    tandem(&dir, "bob")
        .args(["lock", "release"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("held by alice"));

    let refused = json_out(tandem(&dir, "bob").args(["audit", "--op", "acquire"]));
    let entries = refused.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["success"], true);
    assert_eq!(entries[1]["actor"], "bob");
    assert_eq!(entries[1]["success"], false);
}

#[test]
fn force_break_is_audited() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    tandem(&dir, "alice")
        .args(["lock", "acquire"])
        .assert()
        .success();

    let broken = json_out(tandem(&dir, "bob").args(["lock", "break", "--reason", "alice is away"]));
    assert_eq!(broken["broken"], true);
    assert_eq!(broken["displaced_holder"], "alice");

    let entries = json_out(tandem(&dir, "bob").args(["audit", "--op", "force_break"]));
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let details = entries[0]["details"].as_str().unwrap();
    assert!(details.contains("alice"));
    assert!(details.contains("alice is away"));

    tandem(&dir, "bob")
        .args(["lock", "acquire"])
        .assert()
        .success();
}

#[test]
fn break_without_lock_still_logs() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    tandem(&dir, "carol")
        .args(["lock", "break", "--reason", "checking"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No lock was held"));

    tandem(&dir, "carol")
        .args(["audit", "--tail", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("displaced none"));
}

// ---------------------------------------------------------------------------
// tandem config / queue / commit
// ---------------------------------------------------------------------------

#[test]
fn config_validate_default_is_clean() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    tandem(&dir, "alice")
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No warnings"));
}

#[test]
fn config_validate_rejects_shared_branch() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    std::fs::write(
        dir.path().join(".tandem/config.yaml"),
        "branches:\n  draft: main\n  working: main\n",
    )
    .unwrap();
    tandem(&dir, "alice")
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"));
}

#[test]
fn config_show_fills_defaults() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    let config = json_out(tandem(&dir, "alice").args(["config", "show"]));
    assert_eq!(config["monitor"]["debounce_secs"], 30);
    assert_eq!(config["branches"]["draft"], "draft");
}

#[test]
fn empty_queue_stats() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    let stats = json_out(tandem(&dir, "alice").args(["queue", "stats"]));
    assert_eq!(stats["total"], 0);
    tandem(&dir, "alice")
        .args(["queue", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("empty"));
}

#[test]
fn commit_without_engine_program_fails() {
    let dir = TempDir::new().unwrap();
    tandem(&dir, "alice")
        .args(["init", "--engine", "tandem-no-such-vcs"])
        .assert()
        .success();
    tandem(&dir, "alice")
        .args(["commit", "-m", "Mix v1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot use VCS program"));
}
