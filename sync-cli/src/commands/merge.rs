//! Three-way merge of files.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use sync_core::merge::MergeFailure;
use sync_core::{three_way_merge, MergeResult};

/// Exit code when the merge leaves conflicts.
pub const CONFLICT_EXIT: u8 = 1;

/// Run the merge command.
pub async fn run(base: &Path, local: &Path, remote: &Path, output: Option<&Path>) -> Result<ExitCode> {
    let base_text = read(base).await?;
    let local_text = read(local).await?;
    let remote_text = read(remote).await?;

    match three_way_merge(&base_text, &local_text, &remote_text) {
        MergeResult::Success(success) => {
            tracing::debug!("merged cleanly with {} patches", success.patches.len());
            match output {
                Some(path) => tokio::fs::write(path, &success.merged)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{}", success.merged),
            }
            Ok(ExitCode::SUCCESS)
        }
        MergeResult::Failure(failure) => {
            tracing::info!("{} conflicting regions", failure.conflict_regions.len());
            print!("{}", render_conflicts(&failure));
            Ok(ExitCode::from(CONFLICT_EXIT))
        }
    }
}

async fn read(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Human-readable listing of every conflicting region.
pub fn render_conflicts(failure: &MergeFailure) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} conflict(s)", failure.conflict_regions.len());
    for (i, region) in failure.conflict_regions.iter().enumerate() {
        let _ = writeln!(
            out,
            "\n[{}] base lines {}-{}",
            i + 1,
            region.base_start + 1,
            region.base_end
        );
        let _ = writeln!(out, "<<<<<<< local");
        push_block(&mut out, &region.local);
        let _ = writeln!(out, "||||||| base");
        push_block(&mut out, &region.base);
        let _ = writeln!(out, "=======");
        push_block(&mut out, &region.remote);
        let _ = writeln!(out, ">>>>>>> remote");
    }
    out
}

fn push_block(out: &mut String, text: &str) {
    out.push_str(text);
    if !text.is_empty() && !text.ends_with('\n') {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(base: &str, local: &str, remote: &str) -> MergeFailure {
        match three_way_merge(base, local, remote) {
            MergeResult::Failure(failure) => failure,
            MergeResult::Success(success) => panic!("expected conflict, merged {:?}", success.merged),
        }
    }

    #[test]
    fn render_lists_each_side() {
        let failure = conflict("a\nb\nc\n", "a\nX\nc\n", "a\nY\nc\n");
        let rendered = render_conflicts(&failure);

        assert!(rendered.starts_with("1 conflict(s)"));
        assert!(rendered.contains("<<<<<<< local\nX\n"));
        assert!(rendered.contains("||||||| base\nb\n"));
        assert!(rendered.contains("=======\nY\n"));
        assert!(rendered.contains(">>>>>>> remote"));
    }

    #[test]
    fn render_terminates_unterminated_lines() {
        let failure = conflict("a", "b", "c");
        let rendered = render_conflicts(&failure);

        assert!(rendered.contains("<<<<<<< local\nb\n"));
        assert!(rendered.contains("=======\nc\n>>>>>>> remote"));
    }

    #[tokio::test]
    async fn clean_merge_writes_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let local = dir.path().join("local");
        let remote = dir.path().join("remote");
        let output = dir.path().join("out");
        std::fs::write(&base, "one\ntwo\nthree\n").unwrap();
        std::fs::write(&local, "ONE\ntwo\nthree\n").unwrap();
        std::fs::write(&remote, "one\ntwo\nTHREE\n").unwrap();

        run(&base, &local, &remote, Some(&output)).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "ONE\ntwo\nTHREE\n");
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = run(&missing, &missing, &missing, None).await.unwrap_err();
        assert!(err.to_string().contains("Failed to read"));
    }
}
