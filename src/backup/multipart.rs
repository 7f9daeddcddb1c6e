// backupagent/src/backup/multipart.rs
use async_trait::async_trait;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::errors::UploadError;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One acknowledged part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    pub part_number: i32,
    pub e_tag: String,
}

/// Multipart transfer primitives of an object store.
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Starts a session for `key` and returns its upload id.
    async fn initiate(&self, key: &str) -> Result<String, UploadError>;

    /// Uploads one part and returns the backend's integrity tag for it.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> Result<String, UploadError>;

    /// Assembles the parts, in the given order, into the object at `key`.
    async fn complete(&self, key: &str, upload_id: &str, parts: &[PartReceipt]) -> Result<(), UploadError>;

    async fn abort(&self, key: &str, upload_id: &str) -> Result<(), UploadError>;
}

/// Accumulates bytes and cuts them into parts of exactly `part_size` bytes.
///
/// Only the residue handed out by [`PartAssembler::finish`] may be shorter.
#[derive(Debug)]
pub struct PartAssembler {
    part_size: usize,
    buffer: Vec<u8>,
}

impl PartAssembler {
    pub fn new(part_size: NonZeroUsize) -> Self {
        let part_size = part_size.get();
        Self {
            part_size,
            buffer: Vec::with_capacity(part_size),
        }
    }

    /// Appends `data` and returns every part that reached the threshold.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut full = Vec::new();
        while !data.is_empty() {
            let room = self.part_size - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.part_size {
                full.push(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.part_size),
                ));
            }
        }
        full
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Hands out the residual bytes, if any.
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer)
        }
    }
}

/// Bookkeeping for one in-flight multipart transfer.
#[derive(Debug)]
pub struct UploadSession {
    key: String,
    upload_id: String,
    parts: Vec<PartReceipt>,
}

impl UploadSession {
    pub fn new(key: String, upload_id: String) -> Self {
        Self {
            key,
            upload_id,
            parts: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// The number the next part must carry.
    pub fn next_part_number(&self) -> i32 {
        self.parts.len() as i32 + 1
    }

    /// Records an acknowledged part. Numbers must arrive as 1, 2, 3, ...
    pub fn record(&mut self, receipt: PartReceipt) -> Result<(), UploadError> {
        let expected = self.next_part_number();
        if receipt.part_number != expected {
            return Err(UploadError::PartOrder {
                expected,
                got: receipt.part_number,
            });
        }
        self.parts.push(receipt);
        Ok(())
    }

    pub fn parts(&self) -> &[PartReceipt] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<PartReceipt> {
        self.parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<PartReceipt>,
    pub bytes: u64,
}

/// Streams a local file to a [`MultipartStore`] as an ordered run of parts.
#[derive(Clone)]
pub struct ChunkedUploader {
    store: Arc<dyn MultipartStore>,
    part_size: NonZeroUsize,
    request_timeout: Duration,
}

impl ChunkedUploader {
    pub fn new(store: Arc<dyn MultipartStore>, part_size: NonZeroUsize, request_timeout: Duration) -> Self {
        Self {
            store,
            part_size,
            request_timeout,
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size.get()
    }

    /// Uploads `archive_path` to `key`.
    ///
    /// Parts are sent one at a time in read order. On any failure the session
    /// is aborted on a best-effort basis and the error is returned; nothing is
    /// retried here.
    pub async fn upload(&self, archive_path: &Path, key: &str) -> Result<UploadResult, UploadError> {
        let file = tokio::fs::File::open(archive_path).await?;
        let upload_id = self.bounded("initiate", self.store.initiate(key)).await?;
        let mut session = UploadSession::new(key.to_string(), upload_id);
        debug!(key, upload_id = session.upload_id(), "Multipart upload initiated");

        match self.transfer(file, &mut session).await {
            Ok(bytes) => {
                info!(
                    key,
                    parts = session.parts().len(),
                    bytes,
                    "✅ Multipart upload completed"
                );
                let upload_id = session.upload_id().to_string();
                Ok(UploadResult {
                    key: key.to_string(),
                    upload_id,
                    parts: session.into_parts(),
                    bytes,
                })
            }
            Err(err) => {
                self.abort_quietly(&session).await;
                Err(err)
            }
        }
    }

    async fn transfer(&self, mut file: tokio::fs::File, session: &mut UploadSession) -> Result<u64, UploadError> {
        let mut assembler = PartAssembler::new(self.part_size);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let mut total: u64 = 0;

        loop {
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            total += read as u64;
            for part in assembler.push(&chunk[..read]) {
                self.send_part(session, part).await?;
            }
        }

        debug!(key = session.key(), total, residue = assembler.buffered(), "Archive fully read");
        match assembler.finish() {
            Some(residue) => self.send_part(session, residue).await?,
            // An empty archive still needs one (empty) part to be completable.
            None if session.parts().is_empty() => self.send_part(session, Vec::new()).await?,
            None => {}
        }

        self.bounded(
            "complete",
            self.store
                .complete(session.key(), session.upload_id(), session.parts()),
        )
        .await?;
        Ok(total)
    }

    async fn send_part(&self, session: &mut UploadSession, body: Vec<u8>) -> Result<(), UploadError> {
        let part_number = session.next_part_number();
        let size = body.len();
        let e_tag = self
            .bounded(
                "upload_part",
                self.store
                    .upload_part(session.key(), session.upload_id(), part_number, body),
            )
            .await?;
        debug!(key = session.key(), part_number, size, "Part uploaded");
        session.record(PartReceipt { part_number, e_tag })
    }

    async fn abort_quietly(&self, session: &UploadSession) {
        let result = self
            .bounded("abort", self.store.abort(session.key(), session.upload_id()))
            .await;
        if let Err(e) = result {
            warn!(
                key = session.key(),
                upload_id = session.upload_id(),
                error = %e,
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }

    async fn bounded<T, F>(&self, stage: &'static str, fut: F) -> Result<T, UploadError>
    where
        F: Future<Output = Result<T, UploadError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Timeout {
                stage,
                after: self.request_timeout,
            }),
        }
    }
}
