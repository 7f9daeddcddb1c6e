// backupagent/src/backup/cleanup.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::CleanupError;

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Paths that were already gone.
    pub missing: Vec<PathBuf>,
    pub failed: Vec<CleanupError>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes transient archives and, after a confirmed upload, the sources.
///
/// Every operation is idempotent: a path that no longer exists is not an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupManager;

impl CleanupManager {
    /// Removes the transient archive. Returns whether a file was actually deleted.
    pub async fn discard_archive(&self, archive: &Path) -> Result<bool, CleanupError> {
        match tokio::fs::remove_file(archive).await {
            Ok(()) => {
                debug!(archive = %archive.display(), "Archive removed");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CleanupError {
                path: archive.to_path_buf(),
                source,
            }),
        }
    }

    /// Deletes the archive and every source file. Only call this once the
    /// upload of `archive` has been completed by the store.
    ///
    /// A failure on one file is recorded and the remaining files are still
    /// processed.
    pub async fn cleanup(&self, sources: &[PathBuf], archive: &Path) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.discard_archive(archive).await {
            Ok(true) => report.removed.push(archive.to_path_buf()),
            Ok(false) => report.missing.push(archive.to_path_buf()),
            Err(e) => {
                warn!(error = %e, "Failed to remove archive");
                report.failed.push(e);
            }
        }

        for source in sources {
            match tokio::fs::remove_file(source).await {
                Ok(()) => report.removed.push(source.clone()),
                Err(e) if e.kind() == ErrorKind::NotFound => report.missing.push(source.clone()),
                Err(source_err) => {
                    let err = CleanupError {
                        path: source.clone(),
                        source: source_err,
                    };
                    warn!(error = %err, "Failed to remove source file, continuing");
                    report.failed.push(err);
                }
            }
        }

        debug!(
            removed = report.removed.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Cleanup finished"
        );
        report
    }
}
