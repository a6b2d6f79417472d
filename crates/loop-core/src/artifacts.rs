//! Artifact snapshotting: copying workspace files a run produced into its
//! durable artifact tree (Section 3, Section 4.E "Artifact snapshot
//! triggers").
//!
//! Grounded in the reference `snapshot_workspace_file`, with the sha256
//! checksum bookkeeping kept from the reference implementation's
//! dual-location mirroring (this system only ever mirrors to one place:
//! `<run_dir>/artifacts/`).

use crate::types::{Artifact, Id};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("path escapes workspace: {0}")]
    PathEscape(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Resolve `rel_path` against `workspace` and reject any path that
/// escapes it, mirroring the confinement check the sandbox applies.
fn resolve_within(root: &Path, rel_path: &str) -> Result<PathBuf> {
    let candidate = root.join(rel_path);
    let root_abs = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());
    let parent = candidate.parent().unwrap_or(root);
    let parent_abs = parent.canonicalize().unwrap_or_else(|_| parent.to_path_buf());
    if !parent_abs.starts_with(&root_abs) {
        return Err(ArtifactError::PathEscape(rel_path.to_string()));
    }
    Ok(candidate)
}

fn compute_checksum(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Copy a produced workspace file into `<run_dir>/artifacts/<rel_path>`
/// and return the resulting `Artifact` record.
///
/// `rel_path` is the path relative to the workspace root, using `/`
/// separators; it becomes the artifact's `rel_path` unchanged.
pub fn snapshot_workspace_file(
    workspace: &Path,
    run_dir: &Path,
    run_id: &Id,
    rel_path: &str,
) -> Result<Artifact> {
    let source = resolve_within(workspace, rel_path)?;
    if !source.is_file() {
        return Err(ArtifactError::SourceNotFound(source));
    }

    let dest = resolve_within(&run_dir.join("artifacts"), rel_path)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source, &dest)?;

    let checksum = compute_checksum(&dest)?;
    let size_bytes = fs::metadata(&dest)?.len();

    Ok(Artifact {
        id: Id::new(),
        run_id: run_id.clone(),
        rel_path: rel_path.replace('\\', "/"),
        checksum,
        size_bytes,
        created_at: Utc::now(),
    })
}

/// List every file presently stored under a run's artifact tree.
pub fn list_artifacts(run_dir: &Path) -> Result<Vec<PathBuf>> {
    let artifacts_dir = run_dir.join("artifacts");
    if !artifacts_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut stack = vec![artifacts_dir.clone()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                out.push(path.strip_prefix(&artifacts_dir).unwrap().to_path_buf());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_copies_file_and_records_checksum() {
        let workspace = tempdir().unwrap();
        let run_dir = tempdir().unwrap();
        fs::write(workspace.path().join("out.txt"), b"hello").unwrap();

        let run_id = Id::from_string("abc123");
        let artifact =
            snapshot_workspace_file(workspace.path(), run_dir.path(), &run_id, "out.txt").unwrap();

        assert_eq!(artifact.rel_path, "out.txt");
        assert_eq!(artifact.size_bytes, 5);
        assert!(run_dir.path().join("artifacts/out.txt").is_file());

        let mut hasher = Sha256::new();
        hasher.update(b"hello");
        assert_eq!(artifact.checksum, format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn snapshot_creates_nested_directories() {
        let workspace = tempdir().unwrap();
        let run_dir = tempdir().unwrap();
        fs::create_dir_all(workspace.path().join("reports")).unwrap();
        fs::write(workspace.path().join("reports/summary.md"), b"data").unwrap();

        let run_id = Id::from_string("abc123");
        let artifact = snapshot_workspace_file(
            workspace.path(),
            run_dir.path(),
            &run_id,
            "reports/summary.md",
        )
        .unwrap();

        assert_eq!(artifact.rel_path, "reports/summary.md");
        assert!(run_dir.path().join("artifacts/reports/summary.md").is_file());
    }

    #[test]
    fn snapshot_rejects_path_escape() {
        let workspace = tempdir().unwrap();
        let run_dir = tempdir().unwrap();
        let err = snapshot_workspace_file(workspace.path(), run_dir.path(), &Id::new(), "../escape.txt")
            .unwrap_err();
        assert!(matches!(err, ArtifactError::PathEscape(_)));
    }

    #[test]
    fn snapshot_missing_source_is_an_error() {
        let workspace = tempdir().unwrap();
        let run_dir = tempdir().unwrap();
        let err = snapshot_workspace_file(workspace.path(), run_dir.path(), &Id::new(), "missing.txt")
            .unwrap_err();
        assert!(matches!(err, ArtifactError::SourceNotFound(_)));
    }

    #[test]
    fn list_artifacts_returns_relative_paths() {
        let workspace = tempdir().unwrap();
        let run_dir = tempdir().unwrap();
        fs::write(workspace.path().join("a.txt"), b"1").unwrap();
        fs::write(workspace.path().join("b.txt"), b"2").unwrap();
        let run_id = Id::new();
        snapshot_workspace_file(workspace.path(), run_dir.path(), &run_id, "a.txt").unwrap();
        snapshot_workspace_file(workspace.path(), run_dir.path(), &run_id, "b.txt").unwrap();

        let mut listed = list_artifacts(run_dir.path()).unwrap();
        listed.sort();
        assert_eq!(listed, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
    }
}
