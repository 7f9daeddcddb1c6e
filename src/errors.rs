// backupagent/src/errors.rs
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Archive creation failed; no usable archive was produced.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive source is missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Archive source is unreadable: {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write archive {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stale archive {path} could not be removed: {source}")]
    StaleArchive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive task failed: {0}")]
    Task(String),
}

/// Multipart transfer failed at one of its stages.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to read archive: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to initiate multipart upload for {key}: {message}")]
    Initiate { key: String, message: String },

    #[error("Backend returned no upload id for {0}")]
    MissingUploadId(String),

    #[error("Failed to upload part {part_number}: {message}")]
    Part { part_number: i32, message: String },

    #[error("Part {got} received out of order, expected part {expected}")]
    PartOrder { expected: i32, got: i32 },

    #[error("Failed to complete multipart upload for {key}: {message}")]
    Complete { key: String, message: String },

    #[error("Failed to abort multipart upload {upload_id}: {message}")]
    Abort { upload_id: String, message: String },

    #[error("Storage {stage} call timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
}

/// One file could not be removed. Never fatal to a run.
#[derive(Error, Debug)]
#[error("Failed to remove {path}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Sending the run summary failed. Never rolls back an upload.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Mail relay request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Mail relay rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Nothing to notify")]
    Empty,
}

/// Errors that abandon the current run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Scanning {path} failed: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("Archiving {artifact} failed: {source}")]
    Archive {
        artifact: String,
        #[source]
        source: ArchiveError,
    },

    #[error("Uploading {artifact} failed: {source}")]
    Upload {
        artifact: String,
        #[source]
        source: UploadError,
    },
}
