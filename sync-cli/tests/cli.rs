//! End-to-end tests for the `trisync` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use sync_client::{FilePersistence, Persistence};
use sync_types::{Guid, LcaState, Metadata, PersistedState};

fn trisync(state_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("trisync").unwrap();
    // Keep tests off the user's config.
    let config = state_dir.join("trisync.toml");
    if !config.exists() {
        fs::write(&config, "").unwrap();
    }
    cmd.env_remove("RUST_LOG")
        .arg("--config")
        .arg(config)
        .arg("--state-dir")
        .arg(state_dir);
    cmd
}

fn write_inputs(dir: &Path, base: &str, local: &str, remote: &str) {
    fs::write(dir.join("base.md"), base).unwrap();
    fs::write(dir.join("local.md"), local).unwrap();
    fs::write(dir.join("remote.md"), remote).unwrap();
}

// ===========================================
// merge
// ===========================================

#[test]
fn merge_clean_prints_result() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "a\nb\nc\n", "A\nb\nc\n", "a\nb\nC\n");

    trisync(dir.path())
        .current_dir(dir.path())
        .args(["merge", "base.md", "local.md", "remote.md"])
        .assert()
        .success()
        .stdout("A\nb\nC\n");
}

#[test]
fn merge_clean_writes_output() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "a\nb\n", "a\nb\nlocal\n", "remote\na\nb\n");

    trisync(dir.path())
        .current_dir(dir.path())
        .args(["merge", "base.md", "local.md", "remote.md", "--output", "out.md"])
        .assert()
        .success()
        .stdout("");

    let merged = fs::read_to_string(dir.path().join("out.md")).unwrap();
    assert_eq!(merged, "remote\na\nb\nlocal\n");
}

#[test]
fn merge_conflict_exits_with_one() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "title\nbody\n", "title\nmine\n", "title\ntheirs\n");

    trisync(dir.path())
        .current_dir(dir.path())
        .args(["merge", "base.md", "local.md", "remote.md", "--output", "out.md"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 conflict(s)"))
        .stdout(predicate::str::contains("<<<<<<< local\nmine\n"))
        .stdout(predicate::str::contains("=======\ntheirs\n"));

    assert!(!dir.path().join("out.md").exists());
}

#[test]
fn merge_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();

    trisync(dir.path())
        .current_dir(dir.path())
        .args(["merge", "base.md", "local.md", "remote.md"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read"));
}

// ===========================================
// status
// ===========================================

#[test]
fn status_empty_state_dir() {
    let dir = tempfile::tempdir().unwrap();

    trisync(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No persisted documents."));
}

#[tokio::test]
async fn status_lists_persisted_documents() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = FilePersistence::new(dir.path(), "default");

    let mut synced = PersistedState::new(Guid::from("doc-1"), "notes/one.md");
    synced.lca = Some(LcaState {
        contents: "one".into(),
        meta: Metadata::for_contents("one", 10),
        state_vector: Vec::new(),
    });
    synced.disk = Some(Metadata::for_contents("one", 10));
    persistence.save_state(&synced).await.unwrap();

    let mut pending = PersistedState::new(Guid::from("doc-2"), "notes/two.md");
    pending.disk = Some(Metadata::for_contents("two", 20));
    persistence.save_state(&pending).await.unwrap();

    trisync(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("doc-1  notes/one.md"))
        .stdout(predicate::str::contains("pending   doc-2  notes/two.md"))
        .stdout(predicate::str::contains("2 documents:"));
}

#[test]
fn status_reports_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("trisync.toml"), "[pool]\nmax_concurrent_warm = -1\n").unwrap();

    trisync(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config file"));
}

// ===========================================
// validate
// ===========================================

#[test]
fn validate_shipped_chart() {
    let dir = tempfile::tempdir().unwrap();

    trisync(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("chart 'document'"))
        .stdout(predicate::str::contains("ok"));
}
