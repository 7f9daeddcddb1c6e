// backupagent/src/backup/logic.rs
use chrono::{DateTime, Local, NaiveDate, Timelike};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::backup::archive::{ArchiveOutcome, Archiver};
use crate::backup::cleanup::CleanupManager;
use crate::backup::multipart::{ChunkedUploader, MultipartStore};
use crate::backup::notify::{Notifier, should_notify};
use crate::config::{ArchiveMode, GuardScope, PipelineConfig};
use crate::errors::{ArchiveError, PipelineError};
use crate::utils::{file_archive_name, full_file_archive_name, hourly_archive_name, object_key};

/// A unit of backup data discovered at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Logical name; also the archive file name and the last key segment.
    pub name: String,
    pub paths: Vec<PathBuf>,
    pub discovered_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Scanning,
    Archiving,
    Uploading,
    CleaningUp,
    Notifying,
}

impl RunPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunPhase::Scanning,
            2 => RunPhase::Archiving,
            3 => RunPhase::Uploading,
            4 => RunPhase::CleaningUp,
            5 => RunPhase::Notifying,
            _ => RunPhase::Idle,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Scanning => "scanning",
            RunPhase::Archiving => "archiving",
            RunPhase::Uploading => "uploading",
            RunPhase::CleaningUp => "cleaning-up",
            RunPhase::Notifying => "notifying",
        };
        f.write_str(name)
    }
}

type HourSlot = (NaiveDate, u32);

/// Process-wide run bookkeeping: the single-flight flag, the current phase,
/// and the artifact names still waiting to be reported.
#[derive(Debug)]
pub struct RunState {
    active: AtomicBool,
    phase: AtomicU8,
    pending: Mutex<Vec<String>>,
    last_upload_slot: Mutex<Option<HourSlot>>,
}

/// Holds the single-flight flag; releases it when dropped, including on unwind.
#[derive(Debug)]
pub struct RunGuard<'a> {
    state: &'a RunState,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.end_run();
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            phase: AtomicU8::new(RunPhase::Idle as u8),
            pending: Mutex::new(Vec::new()),
            last_upload_slot: Mutex::new(None),
        }
    }

    /// Claims the run slot. `None` means another run is active.
    pub fn try_begin_run(&self) -> Option<RunGuard<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { state: self })
    }

    pub fn end_run(&self) {
        self.phase.store(RunPhase::Idle as u8, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn enter(&self, phase: RunPhase) {
        self.phase.store(phase as u8, Ordering::Release);
        debug!(%phase, "Entering phase");
    }

    pub async fn pending(&self) -> Vec<String> {
        self.pending.lock().await.clone()
    }

    async fn push_pending(&self, name: String) {
        self.pending.lock().await.push(name);
    }

    async fn clear_sent(&self, sent: usize) {
        let mut pending = self.pending.lock().await;
        let sent = sent.min(pending.len());
        pending.drain(..sent);
    }

    async fn hour_already_done(&self, now: DateTime<Local>) -> bool {
        *self.last_upload_slot.lock().await == Some(hour_slot(now))
    }

    async fn mark_hour_done(&self, now: DateTime<Local>) {
        *self.last_upload_slot.lock().await = Some(hour_slot(now));
    }
}

fn hour_slot(now: DateTime<Local>) -> HourSlot {
    (now.date_naive(), now.hour())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RunInProgress,
    HourAlreadyDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationStatus {
    NotDue,
    Sent(usize),
    Failed(String),
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationStatus::NotDue => f.write_str("not due"),
            NotificationStatus::Sent(count) => write!(f, "sent ({} names)", count),
            NotificationStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedArtifact {
    pub name: String,
    pub key: String,
    pub parts: usize,
    pub bytes: u64,
    pub cleanup_failures: usize,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub uploaded: Vec<UploadedArtifact>,
    pub notification: NotificationStatus,
}

#[derive(Debug)]
pub enum RunOutcome {
    Skipped(SkipReason),
    NothingToDo,
    Completed(RunReport),
    Failed(PipelineError),
}

/// Drives scan → archive → upload → cleanup → notify under the single-flight guard.
pub struct Orchestrator {
    config: PipelineConfig,
    archiver: Arc<dyn Archiver>,
    uploader: ChunkedUploader,
    cleanup: CleanupManager,
    notifier: Arc<dyn Notifier>,
    state: RunState,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        archiver: Arc<dyn Archiver>,
        store: Arc<dyn MultipartStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let uploader = ChunkedUploader::new(store, config.part_size, config.request_timeout);
        Self {
            config,
            archiver,
            uploader,
            cleanup: CleanupManager,
            notifier,
            state: RunState::new(),
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Entry point for the scheduler.
    pub async fn tick(&self) -> RunOutcome {
        self.tick_at(Local::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Local>) -> RunOutcome {
        let Some(_guard) = self.state.try_begin_run() else {
            info!("Backup run already in progress. Skipping this tick.");
            return RunOutcome::Skipped(SkipReason::RunInProgress);
        };

        if self.config.guard_scope == GuardScope::PerHour && self.state.hour_already_done(now).await {
            debug!(hour = now.hour(), "Files already uploaded this hour. Skipping this tick.");
            return RunOutcome::Skipped(SkipReason::HourAlreadyDone);
        }

        let run_id = Uuid::new_v4();
        let outcome = self
            .run(run_id, now)
            .instrument(info_span!("backup_run", %run_id))
            .await;

        match &outcome {
            RunOutcome::Completed(report) => {
                for item in &report.uploaded {
                    debug!(
                        artifact = %item.name,
                        key = %item.key,
                        parts = item.parts,
                        bytes = item.bytes,
                        cleanup_failures = item.cleanup_failures,
                        "Artifact shipped"
                    );
                }
                info!(
                    run_id = %report.run_id,
                    uploaded = report.uploaded.len(),
                    notification = %report.notification,
                    "🎉 Backup run completed"
                );
            }
            RunOutcome::Failed(e) => error!(
                %run_id,
                error = %e,
                "❌ Backup run abandoned; sources kept for the next tick"
            ),
            RunOutcome::NothingToDo => debug!(%run_id, "Nothing to back up"),
            RunOutcome::Skipped(reason) => debug!(?reason, "Tick skipped"),
        }
        outcome
    }

    async fn run(&self, run_id: Uuid, now: DateTime<Local>) -> RunOutcome {
        self.state.enter(RunPhase::Scanning);
        let artifacts = match self.scan(now).await {
            Ok(artifacts) => artifacts,
            Err(e) => return RunOutcome::Failed(e),
        };
        if artifacts.is_empty() {
            info!(source = %self.config.source_dir.display(), "No files to upload. Skipping upload.");
            return RunOutcome::NothingToDo;
        }
        info!(
            artifacts = artifacts.len(),
            part_size = self.uploader.part_size(),
            "🚀 Starting backup run"
        );

        let mut uploaded = Vec::new();
        for artifact in &artifacts {
            match self.process(artifact, now).await {
                Ok(Some(done)) => uploaded.push(done),
                Ok(None) => {}
                Err(e) => {
                    // Artifacts shipped before the failure are already gone from disk.
                    if !uploaded.is_empty() {
                        self.state.enter(RunPhase::Notifying);
                        let notification = self.notify_if_due(uploaded.len(), now).await;
                        warn!(
                            shipped = uploaded.len(),
                            %notification,
                            "Run failed after some artifacts were uploaded"
                        );
                    }
                    return RunOutcome::Failed(e);
                }
            }
        }

        if !uploaded.is_empty() {
            self.state.mark_hour_done(now).await;
        }

        self.state.enter(RunPhase::Notifying);
        let notification = self.notify_if_due(uploaded.len(), now).await;

        RunOutcome::Completed(RunReport {
            run_id,
            uploaded,
            notification,
        })
    }

    /// Lists the artifacts currently in the source directory.
    pub async fn scan(&self, now: DateTime<Local>) -> Result<Vec<Artifact>, PipelineError> {
        let source_dir = &self.config.source_dir;
        let files = list_files(source_dir).await.map_err(|source| PipelineError::Scan {
            path: source_dir.clone(),
            source,
        })?;
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let artifacts = match &self.config.archive_mode {
            ArchiveMode::WholeDirectory => vec![Artifact {
                name: hourly_archive_name(now),
                paths: files,
                discovered_at: now,
            }],
            ArchiveMode::PerFileExtension { extension } => {
                let mut taken = HashSet::new();
                let mut artifacts = Vec::new();
                for path in files.into_iter().filter(|path| has_extension(path, extension)) {
                    let Some(name) = file_archive_name(&path) else {
                        warn!(path = %path.display(), "Skipping file with a non UTF-8 name");
                        continue;
                    };
                    // `x.bak` and `x.BAK` share a stem; the later one keeps its extension.
                    let name = if taken.contains(&name) {
                        match full_file_archive_name(&path) {
                            Some(full) if !taken.contains(&full) => full,
                            _ => {
                                warn!(
                                    path = %path.display(),
                                    archive = %name,
                                    "Archive name already taken in this run. Skipping file."
                                );
                                continue;
                            }
                        }
                    } else {
                        name
                    };
                    taken.insert(name.clone());
                    artifacts.push(Artifact {
                        name,
                        paths: vec![path],
                        discovered_at: now,
                    });
                }
                artifacts
            }
        };
        Ok(artifacts)
    }

    async fn process(
        &self,
        artifact: &Artifact,
        now: DateTime<Local>,
    ) -> Result<Option<UploadedArtifact>, PipelineError> {
        self.state.enter(RunPhase::Archiving);
        debug!(
            artifact = %artifact.name,
            files = artifact.paths.len(),
            discovered_at = %artifact.discovered_at.format("%H:%M:%S"),
            "Archiving artifact"
        );
        let archive_path = self.config.staging_dir.join(&artifact.name);

        // A leftover from a crashed run must never be uploaded as-is.
        if let Err(e) = self.cleanup.discard_archive(&archive_path).await {
            return Err(PipelineError::Archive {
                artifact: artifact.name.clone(),
                source: ArchiveError::StaleArchive {
                    path: e.path,
                    source: e.source,
                },
            });
        }

        let archive = match self.archiver.archive(&artifact.paths, &archive_path).await {
            Ok(ArchiveOutcome::Created(info)) => info,
            Ok(ArchiveOutcome::NothingToArchive) => {
                info!(artifact = %artifact.name, "Sources vanished before archiving. Skipping.");
                return Ok(None);
            }
            Err(source) => {
                self.discard_quietly(&archive_path).await;
                return Err(PipelineError::Archive {
                    artifact: artifact.name.clone(),
                    source,
                });
            }
        };

        self.state.enter(RunPhase::Uploading);
        let key = object_key(&self.config.key_layout, &artifact.name, now);
        info!(artifact = %artifact.name, key = %key, size = archive.size, "Uploading archive");
        let upload = match self.uploader.upload(&archive.path, &key).await {
            Ok(upload) => upload,
            Err(source) => {
                self.discard_quietly(&archive.path).await;
                return Err(PipelineError::Upload {
                    artifact: artifact.name.clone(),
                    source,
                });
            }
        };

        info!(
            artifact = %artifact.name,
            upload_id = %upload.upload_id,
            "✓ Upload confirmed by the store"
        );

        self.state.enter(RunPhase::CleaningUp);
        let report = self.cleanup.cleanup(&artifact.paths, &archive.path).await;
        if !report.is_clean() {
            warn!(
                artifact = %artifact.name,
                failures = report.failed.len(),
                "Some files could not be deleted after upload"
            );
        }
        self.state.push_pending(artifact.name.clone()).await;

        Ok(Some(UploadedArtifact {
            name: artifact.name.clone(),
            key: upload.key,
            parts: upload.parts.len(),
            bytes: upload.bytes,
            cleanup_failures: report.failed.len(),
        }))
    }

    async fn notify_if_due(&self, uploaded_this_run: usize, now: DateTime<Local>) -> NotificationStatus {
        let pending = self.state.pending().await;
        if !should_notify(
            &self.config.notification_schedule,
            uploaded_this_run,
            pending.len(),
            now.hour(),
        ) {
            debug!(pending = pending.len(), "Notification not due");
            return NotificationStatus::NotDue;
        }

        match self.notifier.notify(&pending).await {
            Ok(()) => {
                self.state.clear_sent(pending.len()).await;
                NotificationStatus::Sent(pending.len())
            }
            Err(e) => {
                warn!(error = %e, pending = pending.len(), "Error sending email; names kept for the next attempt");
                NotificationStatus::Failed(e.to_string())
            }
        }
    }

    async fn discard_quietly(&self, archive: &Path) {
        if let Err(e) = self.cleanup.discard_archive(archive).await {
            warn!(error = %e, "Failed to remove transient archive");
        }
    }
}

/// Regular files directly inside `dir`, sorted by path.
async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArchiveError::SourceMissing(dir.to_path_buf()));
        }
        Err(source) => {
            return Err(ArchiveError::SourceUnreadable {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let unreadable = |source| ArchiveError::SourceUnreadable {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        if entry.file_type().await.map_err(unreadable)?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fakes::{FakeArchiver, MemoryStore, RecordingNotifier, StoreCall};
    use crate::backup::multipart::PartReceipt;
    use crate::config::{KeyLayout, NotificationSchedule};
    use crate::errors::UploadError;
    use chrono::TimeZone;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        staging: PathBuf,
        store: Arc<MemoryStore>,
        archiver: Arc<FakeArchiver>,
        notifier: Arc<RecordingNotifier>,
        orchestrator: Arc<Orchestrator>,
    }

    impl Fixture {
        fn new(archiver: FakeArchiver, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let source = dir.path().join("data");
            let staging = dir.path().join("staging");
            std::fs::create_dir_all(&source).unwrap();
            std::fs::create_dir_all(&staging).unwrap();

            let mut config = PipelineConfig {
                source_dir: source.clone(),
                staging_dir: staging.clone(),
                archive_mode: ArchiveMode::WholeDirectory,
                key_layout: KeyLayout {
                    prefix: Some("data".to_string()),
                    namespace_by_hour: false,
                },
                part_size: NonZeroUsize::new(1024).unwrap(),
                notification_schedule: NotificationSchedule::EverySuccess,
                guard_scope: GuardScope::Process,
                request_timeout: Duration::from_secs(5),
            };
            tweak(&mut config);

            let store = Arc::new(MemoryStore::default());
            let archiver = Arc::new(archiver);
            let notifier = Arc::new(RecordingNotifier::default());
            let orchestrator = Arc::new(Orchestrator::new(
                config,
                archiver.clone(),
                store.clone(),
                notifier.clone(),
            ));
            Self {
                _dir: dir,
                source,
                staging,
                store,
                archiver,
                notifier,
                orchestrator,
            }
        }

        fn add_file(&self, name: &str, len: usize) -> PathBuf {
            let path = self.source.join(name);
            std::fs::write(&path, vec![b'x'; len]).unwrap();
            path
        }

        fn staged_files(&self) -> Vec<PathBuf> {
            std::fs::read_dir(&self.staging)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect()
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 1, 15, hour, minute, 0).unwrap()
    }

    fn completed(outcome: RunOutcome) -> RunReport {
        match outcome {
            RunOutcome::Completed(report) => report,
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_files_eleven_mib_archive_three_parts() {
        let fx = Fixture::new(FakeArchiver::new(11 * MIB), |c| c.part_size = NonZeroUsize::new(5 * MIB).unwrap());
        let files = [
            fx.add_file("a.sql", 4 * MIB),
            fx.add_file("b.sql", 4 * MIB),
            fx.add_file("c.sql", 4 * MIB),
        ];

        let report = completed(fx.orchestrator.tick_at(at(9, 0)).await);

        assert_eq!(report.uploaded.len(), 1);
        assert_eq!(report.uploaded[0].name, "backup_09.tar.gz");
        assert_eq!(report.uploaded[0].key, "data/backup_09.tar.gz");
        assert_eq!(report.uploaded[0].parts, 3);
        assert_eq!(fx.store.part_sizes(), vec![5 * MIB, 5 * MIB, MIB]);
        assert_eq!(
            fx.store.completed_parts("data/backup_09.tar.gz").unwrap(),
            vec![
                PartReceipt { part_number: 1, e_tag: "etag-1".into() },
                PartReceipt { part_number: 2, e_tag: "etag-2".into() },
                PartReceipt { part_number: 3, e_tag: "etag-3".into() },
            ]
        );
        assert!(files.iter().all(|f| !f.exists()));
        assert!(fx.staged_files().is_empty());
        assert_eq!(fx.notifier.sent(), vec![vec!["backup_09.tar.gz".to_string()]]);
        assert_eq!(report.notification, NotificationStatus::Sent(1));
        assert!(fx.orchestrator.state().pending().await.is_empty());
        assert!(!fx.orchestrator.state().is_active());
        assert_eq!(fx.orchestrator.state().phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_empty_source_goes_straight_back_to_idle() {
        let fx = Fixture::new(FakeArchiver::new(10), |_| {});

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(outcome, RunOutcome::NothingToDo));
        assert_eq!(fx.archiver.calls(), 0);
        assert!(fx.store.calls().is_empty());
        assert!(fx.staged_files().is_empty());
        assert_eq!(fx.notifier.attempts(), 0);
        assert!(!fx.orchestrator.state().is_active());
    }

    #[tokio::test]
    async fn test_missing_source_directory_fails_the_run() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| c.source_dir = PathBuf::from("/nonexistent/backupagent"));

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(PipelineError::Scan { source: ArchiveError::SourceMissing(_), .. })
        ));
        assert!(!fx.orchestrator.state().is_active());
    }

    #[tokio::test]
    async fn test_second_part_failure_keeps_sources_and_next_tick_retries() {
        let fx = Fixture::new(FakeArchiver::new(3000), |_| {});
        let file = fx.add_file("nightly.sql", 100);
        fx.store.fail_part(2);

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(PipelineError::Upload { source: UploadError::Part { part_number: 2, .. }, .. })
        ));
        assert!(file.exists());
        assert!(fx.staged_files().is_empty());
        assert!(!fx.store.calls().contains(&StoreCall::Complete));
        assert!(fx.orchestrator.state().pending().await.is_empty());
        assert_eq!(fx.notifier.attempts(), 0);
        assert!(!fx.orchestrator.state().is_active());

        let report = completed(fx.orchestrator.tick_at(at(9, 1)).await);

        assert_eq!(fx.archiver.calls(), 2);
        assert_eq!(report.uploaded[0].parts, 3);
        assert_eq!(fx.store.object("data/backup_09.tar.gz").map(|o| o.len()), Some(3000));
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_complete_failure_never_deletes_sources() {
        let fx = Fixture::new(FakeArchiver::new(10), |_| {});
        let file = fx.add_file("nightly.sql", 10);
        fx.store.fail_complete();

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::Upload { .. })));
        assert!(file.exists());
        assert!(fx.staged_files().is_empty());
    }

    #[tokio::test]
    async fn test_archive_failure_abandons_run_untouched() {
        let fx = Fixture::new(FakeArchiver::new(10), |_| {});
        let file = fx.add_file("nightly.sql", 10);
        fx.archiver.fail_next();

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::Archive { .. })));
        assert!(file.exists());
        assert!(fx.store.calls().is_empty());
        assert!(!fx.orchestrator.state().is_active());
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_name_for_next_attempt() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| {
            c.archive_mode = ArchiveMode::PerFileExtension { extension: "bak".to_string() };
        });
        let first = fx.add_file("first.bak", 10);
        fx.notifier.set_failing(true);

        let report = completed(fx.orchestrator.tick_at(at(9, 0)).await);

        assert!(matches!(report.notification, NotificationStatus::Failed(_)));
        assert!(!first.exists());
        assert_eq!(fx.orchestrator.state().pending().await, vec!["first.tar.gz".to_string()]);

        fx.notifier.set_failing(false);
        fx.add_file("second.bak", 10);
        let report = completed(fx.orchestrator.tick_at(at(9, 5)).await);

        assert_eq!(report.notification, NotificationStatus::Sent(2));
        assert_eq!(
            fx.notifier.sent(),
            vec![vec!["first.tar.gz".to_string(), "second.tar.gz".to_string()]]
        );
        assert!(fx.orchestrator.state().pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_an_upload_still_notifies_shipped_names() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| {
            c.archive_mode = ArchiveMode::PerFileExtension { extension: "bak".to_string() };
        });
        let a = fx.add_file("a.bak", 10);
        let b = fx.add_file("b.bak", 10);
        fx.store.fail_initiate(2);

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(PipelineError::Upload { ref artifact, source: UploadError::Initiate { .. } })
                if artifact == "b.tar.gz"
        ));
        assert!(!a.exists());
        assert!(b.exists());
        assert_eq!(fx.notifier.sent(), vec![vec!["a.tar.gz".to_string()]]);
        assert!(fx.orchestrator.state().pending().await.is_empty());
        assert!(!fx.orchestrator.state().is_active());
    }

    #[tokio::test]
    async fn test_failure_before_any_upload_does_not_notify() {
        let fx = Fixture::new(FakeArchiver::new(10), |_| {});
        fx.add_file("nightly.sql", 10);
        fx.store.fail_initiate(1);

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(outcome, RunOutcome::Failed(PipelineError::Upload { .. })));
        assert_eq!(fx.notifier.attempts(), 0);
    }

    #[tokio::test]
    async fn test_stems_differing_only_in_extension_case_get_distinct_keys() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| {
            c.archive_mode = ArchiveMode::PerFileExtension { extension: "bak".to_string() };
        });
        let upper = fx.add_file("x.BAK", 10);
        let lower = fx.add_file("x.bak", 10);

        let report = completed(fx.orchestrator.tick_at(at(9, 0)).await);

        let names: Vec<&str> = report.uploaded.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["x.tar.gz", "x.bak.tar.gz"]);
        assert_eq!(fx.store.object_keys(), vec!["data/x.bak.tar.gz", "data/x.tar.gz"]);
        assert!(!upper.exists() && !lower.exists());
    }

    #[tokio::test]
    async fn test_tick_while_running_is_dropped() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let fx = Fixture::new(FakeArchiver::gated(10, started.clone(), release.clone()), |_| {});
        fx.add_file("nightly.sql", 10);

        let orchestrator = fx.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.tick_at(at(9, 0)).await });
        started.notified().await;

        assert!(fx.orchestrator.state().is_active());
        assert_eq!(fx.orchestrator.state().phase(), RunPhase::Archiving);
        let second = fx.orchestrator.tick_at(at(9, 0)).await;
        assert!(matches!(second, RunOutcome::Skipped(SkipReason::RunInProgress)));

        release.notify_one();
        completed(first.await.unwrap());

        assert_eq!(fx.archiver.calls(), 1);
        assert_eq!(fx.store.calls().iter().filter(|c| **c == StoreCall::Initiate).count(), 1);
        assert!(!fx.orchestrator.state().is_active());
    }

    #[tokio::test]
    async fn test_guard_released_when_a_step_panics() {
        let fx = Fixture::new(FakeArchiver::new(10), |_| {});
        let file = fx.add_file("nightly.sql", 10);
        fx.archiver.panic_next();

        let orchestrator = fx.orchestrator.clone();
        let joined = tokio::spawn(async move { orchestrator.tick_at(at(9, 0)).await }).await;

        assert!(joined.unwrap_err().is_panic());
        assert!(!fx.orchestrator.state().is_active());
        assert!(file.exists());

        completed(fx.orchestrator.tick_at(at(9, 1)).await);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_per_file_mode_uploads_matching_files_only() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| {
            c.archive_mode = ArchiveMode::PerFileExtension { extension: "bak".to_string() };
            c.staging_dir = c.source_dir.clone();
        });
        let a = fx.add_file("Sales.bak", 10);
        let b = fx.add_file("HR.BAK", 10);
        let notes = fx.add_file("notes.txt", 10);

        let report = completed(fx.orchestrator.tick_at(at(9, 0)).await);

        let names: Vec<&str> = report.uploaded.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["HR.tar.gz", "Sales.tar.gz"]);
        assert_eq!(fx.store.object_keys(), vec!["data/HR.tar.gz", "data/Sales.tar.gz"]);
        assert!(!a.exists() && !b.exists());
        assert!(notes.exists());
        let leftovers: Vec<PathBuf> = std::fs::read_dir(&fx.source)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(leftovers, vec![notes]);
        assert_eq!(
            fx.notifier.sent(),
            vec![vec!["HR.tar.gz".to_string(), "Sales.tar.gz".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_stale_archive_is_replaced() {
        let fx = Fixture::new(FakeArchiver::new(16), |_| {});
        fx.add_file("nightly.sql", 10);
        std::fs::write(fx.staging.join("backup_09.tar.gz"), vec![0u8; 5000]).unwrap();

        completed(fx.orchestrator.tick_at(at(9, 0)).await);

        assert_eq!(fx.store.object("data/backup_09.tar.gz").map(|o| o.len()), Some(16));
    }

    #[tokio::test]
    async fn test_undeletable_stale_archive_fails_before_archiving() {
        let fx = Fixture::new(FakeArchiver::new(16), |_| {});
        let file = fx.add_file("nightly.sql", 10);
        std::fs::create_dir(fx.staging.join("backup_09.tar.gz")).unwrap();

        let outcome = fx.orchestrator.tick_at(at(9, 0)).await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed(PipelineError::Archive { source: ArchiveError::StaleArchive { .. }, .. })
        ));
        assert_eq!(fx.archiver.calls(), 0);
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_hour_namespaced_keys() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| c.key_layout.namespace_by_hour = true);
        fx.add_file("nightly.sql", 10);

        let report = completed(fx.orchestrator.tick_at(at(21, 15)).await);

        assert_eq!(report.uploaded[0].key, "data/21/backup_21.tar.gz");
    }

    #[tokio::test]
    async fn test_fixed_hours_defers_notification() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| {
            c.archive_mode = ArchiveMode::PerFileExtension { extension: "bak".to_string() };
            c.notification_schedule = NotificationSchedule::FixedHours(vec![9]);
        });
        fx.add_file("early.bak", 10);

        let report = completed(fx.orchestrator.tick_at(at(8, 0)).await);
        assert_eq!(report.notification, NotificationStatus::NotDue);
        assert_eq!(fx.notifier.attempts(), 0);

        fx.add_file("late.bak", 10);
        let report = completed(fx.orchestrator.tick_at(at(9, 0)).await);

        assert_eq!(report.notification, NotificationStatus::Sent(2));
        assert_eq!(
            fx.notifier.sent(),
            vec![vec!["early.tar.gz".to_string(), "late.tar.gz".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_per_hour_guard_skips_rest_of_hour() {
        let fx = Fixture::new(FakeArchiver::new(10), |c| c.guard_scope = GuardScope::PerHour);
        fx.add_file("one.sql", 10);
        completed(fx.orchestrator.tick_at(at(10, 0)).await);

        let two = fx.add_file("two.sql", 10);
        let outcome = fx.orchestrator.tick_at(at(10, 30)).await;
        assert!(matches!(outcome, RunOutcome::Skipped(SkipReason::HourAlreadyDone)));
        assert!(two.exists());
        assert!(!fx.orchestrator.state().is_active());

        completed(fx.orchestrator.tick_at(at(11, 0)).await);
        assert!(!two.exists());
    }

    #[test]
    fn test_run_guard_releases_on_drop() {
        let state = RunState::new();
        {
            let _guard = state.try_begin_run().unwrap();
            assert!(state.is_active());
            assert!(state.try_begin_run().is_none());
        }
        assert!(!state.is_active());
        assert!(state.try_begin_run().is_some());
    }
}
