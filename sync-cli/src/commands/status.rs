//! Show sync status of persisted documents.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use sync_client::{FilePersistence, PoolManager};
use sync_types::{PersistedState, SyncStatus};

use crate::config::Config;

/// Run the status command.
///
/// Reads every persisted record in `state_dir`; no document machine is started.
pub async fn run(config: &Config, state_dir: &Path) -> Result<ExitCode> {
    let persistence = FilePersistence::new(state_dir, &config.storage.vault_id);
    let (pool, _effects) =
        PoolManager::with_checker(config.pool.clone(), config.checker.clone(), persistence);

    let count = pool
        .load_all()
        .await
        .with_context(|| format!("Failed to read state from {}", state_dir.display()))?;
    tracing::debug!("{} documents in {}", count, state_dir.display());

    print!("{}", render(state_dir, &pool.cached_statuses()));
    pool.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

/// Table of documents with a per-status summary line.
pub fn render(state_dir: &Path, statuses: &[(PersistedState, SyncStatus)]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== trisync status ===");
    let _ = writeln!(out, "State: {}", state_dir.display());
    let _ = writeln!(out);

    if statuses.is_empty() {
        let _ = writeln!(out, "No persisted documents.");
        return out;
    }

    for (state, status) in statuses {
        let path = if state.path.is_empty() {
            "(no path)"
        } else {
            state.path.as_str()
        };
        let _ = writeln!(out, "  {:<8}  {}  {}", status.to_string(), state.guid, path);
    }

    let count = |wanted: SyncStatus| statuses.iter().filter(|(_, s)| *s == wanted).count();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{} documents: {} synced, {} pending, {} conflict, {} error",
        statuses.len(),
        count(SyncStatus::Synced),
        count(SyncStatus::Pending),
        count(SyncStatus::Conflict),
        count(SyncStatus::Error)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{Guid, Metadata};

    #[test]
    fn render_empty() {
        let out = render(Path::new("/tmp/state"), &[]);
        assert!(out.contains("State: /tmp/state"));
        assert!(out.contains("No persisted documents."));
    }

    #[test]
    fn render_counts_statuses() {
        let synced = PersistedState::new(Guid::from("a"), "a.md");
        let mut pending = PersistedState::new(Guid::from("b"), "b.md");
        pending.disk = Some(Metadata::for_contents("hello", 1));
        let statuses = vec![
            (synced, SyncStatus::Synced),
            (pending, SyncStatus::Pending),
        ];

        let out = render(Path::new("state"), &statuses);

        assert!(out.contains("synced    a  a.md"));
        assert!(out.contains("pending   b  b.md"));
        assert!(out.contains("2 documents: 1 synced, 1 pending, 0 conflict, 0 error"));
    }

    #[tokio::test]
    async fn run_on_missing_directory_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();

        run(&config, &dir.path().join("absent")).await.unwrap();
    }
}
