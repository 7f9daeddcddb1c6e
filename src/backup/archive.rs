// backupagent/src/backup/archive.rs
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::ArchiveError;

/// A finished archive on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created(ArchiveInfo),
    /// The sources held no files. Not a failure.
    NothingToArchive,
}

/// Produces one compressed archive file from a set of sources.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, sources: &[PathBuf], output: &Path) -> Result<ArchiveOutcome, ArchiveError>;
}

/// Gzipped tar archiver backed by the blocking thread pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarGzArchiver;

#[async_trait]
impl Archiver for TarGzArchiver {
    async fn archive(&self, sources: &[PathBuf], output: &Path) -> Result<ArchiveOutcome, ArchiveError> {
        let sources = sources.to_vec();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || create_tar_gz_archive(&sources, &output))
            .await
            .map_err(|e| ArchiveError::Task(e.to_string()))?
    }
}

/// Creates a GZipped TAR archive from files and directories.
///
/// A directory contributes only its immediate regular files. Every entry is
/// stored under its file name, so the archive is flat.
///
/// # Arguments
/// * `sources` - Files or directories to archive.
/// * `archive_dest_path` - Where the `.tar.gz` is written. An existing file is replaced.
///
/// # Returns
/// `NothingToArchive` when the sources contain no files, otherwise the archive path and size.
pub fn create_tar_gz_archive(
    sources: &[PathBuf],
    archive_dest_path: &Path,
) -> Result<ArchiveOutcome, ArchiveError> {
    let files = collect_archive_entries(sources)?;
    if files.is_empty() {
        debug!(sources = ?sources, "Nothing to archive");
        return Ok(ArchiveOutcome::NothingToArchive);
    }

    if let Some(parent) = archive_dest_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| ArchiveError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    info!(
        files = files.len(),
        archive = %archive_dest_path.display(),
        "Creating tar.gz archive"
    );

    let write_err = |source| ArchiveError::Write {
        path: archive_dest_path.to_path_buf(),
        source,
    };

    let archive_file = File::create(archive_dest_path).map_err(write_err)?;
    let enc = GzEncoder::new(archive_file, Compression::best());
    let mut tar_builder = Builder::new(enc);

    for path in &files {
        let name = path
            .file_name()
            .ok_or_else(|| ArchiveError::SourceMissing(path.clone()))?;
        let mut file = File::open(path).map_err(|source| ArchiveError::SourceUnreadable {
            path: path.clone(),
            source,
        })?;
        tar_builder.append_file(name, &mut file).map_err(|source| ArchiveError::SourceUnreadable {
            path: path.clone(),
            source,
        })?;
    }

    let encoder = tar_builder.into_inner().map_err(write_err)?;
    let archive_file = encoder.finish().map_err(write_err)?;
    archive_file.sync_all().map_err(write_err)?;
    let size = archive_file.metadata().map_err(write_err)?.len();

    info!(
        archive = %archive_dest_path.display(),
        size,
        "✓ Tar.gz archive created"
    );
    Ok(ArchiveOutcome::Created(ArchiveInfo {
        path: archive_dest_path.to_path_buf(),
        size,
    }))
}

fn collect_archive_entries(sources: &[PathBuf]) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files = Vec::new();
    for source in sources {
        if !source.exists() {
            return Err(ArchiveError::SourceMissing(source.clone()));
        }
        if source.is_file() {
            files.push(source.clone());
            continue;
        }

        let mut dir_files = Vec::new();
        for entry in WalkDir::new(source).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| ArchiveError::SourceUnreadable {
                path: source.clone(),
                source: e.into(),
            })?;
            if entry.file_type().is_file() {
                dir_files.push(entry.into_path());
            }
        }
        dir_files.sort();
        files.extend(dir_files);
    }
    Ok(files)
}
