// dumpvault/src/backup/cleanup.rs
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::CleanupFailure;

/// Outcome of removing a job's temp files. Every path lands in exactly one bucket.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Paths that were already gone. Not an error.
    pub already_absent: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Paths that may still be on disk.
    pub fn leftover_paths(&self) -> impl Iterator<Item = &Path> {
        self.failures.iter().map(|f| f.path.as_path())
    }
}

/// Best-effort removal of every path; one failure never stops the rest.
pub async fn cleanup<I, P>(paths: I) -> CleanupReport
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let unique: BTreeSet<PathBuf> = paths.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
    let mut report = CleanupReport::default();

    for path in unique {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed temp file");
                report.removed.push(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                report.already_absent.push(path);
            }
            Err(cause) => {
                tracing::warn!(path = %path.display(), error = %cause, "failed to remove temp file");
                report.failures.push(CleanupFailure { path, cause });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_removes_files_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.dump.gz.enc");
        let b = dir.path().join("b.dump.gz.enc");
        let missing = dir.path().join("never-created");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();

        let report = cleanup([&a, &missing, &b, &a]).await;

        assert!(report.is_clean());
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.already_absent, vec![missing]);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_remaining_paths_still_attempted() {
        let dir = tempfile::tempdir().unwrap();
        // remove_file on a directory fails with something other than NotFound.
        let not_a_file = dir.path().join("a-directory");
        std::fs::create_dir(&not_a_file).unwrap();
        let after = dir.path().join("z-file");
        std::fs::write(&after, b"z").unwrap();

        let report = cleanup(vec![not_a_file.clone(), after.clone()]).await;

        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, not_a_file);
        assert_eq!(report.leftover_paths().collect::<Vec<_>>(), vec![not_a_file.as_path()]);
        assert_eq!(report.removed, vec![after.clone()]);
        assert!(!after.exists());
    }
}
