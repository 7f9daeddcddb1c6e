// backupagent/src/backup/fakes.rs
//! In-memory stand-ins for the pipeline's collaborators.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backup::archive::{ArchiveInfo, ArchiveOutcome, Archiver};
use crate::backup::multipart::{MultipartStore, PartReceipt};
use crate::backup::notify::Notifier;
use crate::errors::{ArchiveError, NotifyError, UploadError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Initiate,
    Part(i32),
    Complete,
    Abort,
}

#[derive(Default)]
struct StoreInner {
    next_id: usize,
    sessions: HashMap<String, (String, BTreeMap<i32, Vec<u8>>)>,
    objects: HashMap<String, Vec<u8>>,
    completed: HashMap<String, Vec<PartReceipt>>,
    part_sizes: Vec<usize>,
    calls: Vec<StoreCall>,
    fail_initiate: Option<usize>,
    fail_part: Option<i32>,
    fail_complete: bool,
    stall_parts: bool,
}

/// Multipart store keeping objects in memory. Failure switches are one-shot.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    /// Fails the `nth` initiate call, counting from 1.
    pub fn fail_initiate(&self, nth: usize) {
        self.inner.lock().unwrap().fail_initiate = Some(nth);
    }

    pub fn fail_part(&self, part_number: i32) {
        self.inner.lock().unwrap().fail_part = Some(part_number);
    }

    pub fn fail_complete(&self) {
        self.inner.lock().unwrap().fail_complete = true;
    }

    pub fn stall_parts(&self) {
        self.inner.lock().unwrap().stall_parts = true;
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().objects.get(key).cloned()
    }

    pub fn object_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn completed_parts(&self, key: &str) -> Option<Vec<PartReceipt>> {
        self.inner.lock().unwrap().completed.get(key).cloned()
    }

    pub fn part_sizes(&self) -> Vec<usize> {
        self.inner.lock().unwrap().part_sizes.clone()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl MultipartStore for MemoryStore {
    async fn initiate(&self, key: &str) -> Result<String, UploadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(StoreCall::Initiate);
        inner.next_id += 1;
        if inner.fail_initiate == Some(inner.next_id) {
            inner.fail_initiate = None;
            return Err(UploadError::Initiate {
                key: key.to_string(),
                message: "SlowDown".to_string(),
            });
        }
        let upload_id = format!("upload-{}", inner.next_id);
        inner
            .sessions
            .insert(upload_id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, UploadError> {
        let stall = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(StoreCall::Part(part_number));
            if inner.fail_part == Some(part_number) {
                inner.fail_part = None;
                return Err(UploadError::Part {
                    part_number,
                    message: "connection reset by peer".to_string(),
                });
            }
            inner.stall_parts
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.part_sizes.push(body.len());
        let (_, parts) = inner
            .sessions
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::Part {
                part_number,
                message: format!("unknown upload id {}", upload_id),
            })?;
        parts.insert(part_number, body);
        Ok(format!("etag-{}", part_number))
    }

    async fn complete(&self, key: &str, upload_id: &str, parts: &[PartReceipt]) -> Result<(), UploadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(StoreCall::Complete);
        if inner.fail_complete {
            inner.fail_complete = false;
            return Err(UploadError::Complete {
                key: key.to_string(),
                message: "InvalidPart".to_string(),
            });
        }
        let (_, stored) = inner.sessions.remove(upload_id).ok_or_else(|| UploadError::Complete {
            key: key.to_string(),
            message: format!("unknown upload id {}", upload_id),
        })?;
        let mut object = Vec::new();
        for receipt in parts {
            let body = stored.get(&receipt.part_number).ok_or_else(|| UploadError::Complete {
                key: key.to_string(),
                message: format!("part {} was never uploaded", receipt.part_number),
            })?;
            object.extend_from_slice(body);
        }
        inner.objects.insert(key.to_string(), object);
        inner.completed.insert(key.to_string(), parts.to_vec());
        Ok(())
    }

    async fn abort(&self, _key: &str, upload_id: &str) -> Result<(), UploadError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(StoreCall::Abort);
        inner.sessions.remove(upload_id);
        Ok(())
    }
}

/// Writes a fixed-size payload instead of a real archive.
pub struct FakeArchiver {
    output_size: usize,
    fail_next: AtomicBool,
    panic_next: AtomicBool,
    calls: AtomicUsize,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeArchiver {
    pub fn new(output_size: usize) -> Self {
        Self {
            output_size,
            fail_next: AtomicBool::new(false),
            panic_next: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Each call signals `started` and then waits for `release`.
    pub fn gated(output_size: usize, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((started, release)),
            ..Self::new(output_size)
        }
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn archive(&self, sources: &[PathBuf], output: &Path) -> Result<ArchiveOutcome, ArchiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("archiver blew up");
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ArchiveError::Write {
                path: output.to_path_buf(),
                source: std::io::Error::other("No space left on device"),
            });
        }
        if sources.is_empty() {
            return Ok(ArchiveOutcome::NothingToArchive);
        }
        for source in sources {
            if !source.exists() {
                return Err(ArchiveError::SourceMissing(source.clone()));
            }
        }
        let payload: Vec<u8> = (0..self.output_size).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(output, &payload)
            .await
            .map_err(|source| ArchiveError::Write {
                path: output.to_path_buf(),
                source,
            })?;
        Ok(ArchiveOutcome::Created(ArchiveInfo {
            path: output.to_path_buf(),
            size: self.output_size as u64,
        }))
    }
}

/// Records every notification; can be told to fail.
#[derive(Default)]
pub struct RecordingNotifier {
    fail: AtomicBool,
    sent: Mutex<Vec<Vec<String>>>,
    attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<String>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, artifact_names: &[String]) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                status: 503,
                body: "mail relay unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(artifact_names.to_vec());
        Ok(())
    }
}
