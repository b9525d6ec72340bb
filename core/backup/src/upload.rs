//! Resumable, retried upload of snapshots.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use worldback_common::{Error, Result};
use worldback_storage::{ChunkAck, ObjectSpec, RemoteSession, RemoteStore};

use crate::archiver::Snapshot;
use crate::credentials::CredentialStore;
use crate::retry::{sleep_or_cancel, RetryConfig};

/// Progress of one resumable upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Remote session handle.
    pub remote: RemoteSession,
    /// Bytes the remote has acknowledged. Only ever set from an ack.
    pub bytes_confirmed: u64,
    /// Checksum of the snapshot being uploaded.
    pub snapshot_checksum: String,
    /// Size of the snapshot being uploaded.
    pub total_size: u64,
}

impl UploadSession {
    /// Whether this session can continue uploading `snapshot`.
    pub fn matches(&self, snapshot: &Snapshot) -> bool {
        self.snapshot_checksum == snapshot.checksum && self.total_size == snapshot.size_bytes
    }
}

/// Receives every durable change of the upload session.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// `None` means the session was discarded.
    async fn session_updated(&self, session: Option<&UploadSession>) -> Result<()>;
}

/// Observer that ignores session changes.
pub struct IgnoreSession;

#[async_trait]
impl SessionObserver for IgnoreSession {
    async fn session_updated(&self, _session: Option<&UploadSession>) -> Result<()> {
        Ok(())
    }
}

/// What one upload did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Permanent id of the uploaded object.
    pub remote_id: String,
    /// Chunks the remote answered.
    pub chunks_sent: u32,
    /// Failures that were retried.
    pub retries: u32,
    /// Payload bytes in answered chunks.
    pub bytes_sent: u64,
    /// Offset the upload resumed from.
    pub resumed_from: u64,
    /// Sessions allocated during this upload.
    pub sessions_created: u32,
}

/// Drives snapshots through a [`RemoteStore`]'s resumable sessions.
pub struct UploadManager {
    store: Arc<dyn RemoteStore>,
    credentials: Arc<CredentialStore>,
    chunk_size: u64,
    retry: RetryConfig,
}

impl UploadManager {
    /// Create an upload manager.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        credentials: Arc<CredentialStore>,
        chunk_size: u64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            chunk_size,
            retry,
        }
    }

    /// Chunk size rounded down to the store's alignment.
    pub fn effective_chunk_size(&self) -> u64 {
        let alignment = self.store.chunk_alignment().max(1);
        (self.chunk_size / alignment).max(1) * alignment
    }

    /// Remote id of the object `session` produced, if the remote reports
    /// the upload as finished.
    ///
    /// One round trip, no retries. Callers treat an error like an
    /// unfinished upload.
    pub async fn completed_remote_id(&self, session: &UploadSession) -> Result<Option<String>> {
        let credential = self.credentials.get_valid_token().await?;
        let ack = self
            .store
            .query_session(credential.bearer(), &session.remote, session.total_size)
            .await?;
        Ok(match ack {
            ChunkAck::Complete { remote_id } => Some(remote_id),
            ChunkAck::Incomplete { .. } => None,
        })
    }

    /// Upload `snapshot` as a version of `source`.
    ///
    /// `session` is the session of an earlier, interrupted attempt, if any.
    /// It is kept current as acknowledgements arrive, so after a failure or
    /// cancellation it can be passed back in to resume.
    ///
    /// # Errors
    /// - `UploadFailed` when the retry budget is exhausted
    /// - `AuthenticationRequired` when a refreshed token is rejected too
    /// - `Cancelled` if `cancel` fires
    pub async fn upload(
        &self,
        source: &str,
        snapshot: &Snapshot,
        session: &mut Option<UploadSession>,
        observer: &dyn SessionObserver,
        cancel: &CancellationToken,
    ) -> Result<UploadReport> {
        let chunk_size = self.effective_chunk_size();
        let mut report = UploadReport::default();

        if let Some(existing) = session.as_ref() {
            if !existing.matches(snapshot) || existing.remote.is_expired(Utc::now()) {
                debug!("Discarding stale upload session {}", existing.remote.session_uri);
                *session = None;
                observer.session_updated(None).await?;
            }
        }

        let mut file = File::open(&snapshot.path).await?;
        let object = ObjectSpec {
            name: snapshot.name.clone(),
            source: source.to_string(),
            source_version: snapshot.source_version.clone(),
            checksum: snapshot.checksum.clone(),
            size_bytes: snapshot.size_bytes,
        };

        let mut resuming = session.is_some();
        let mut needs_query = resuming;
        let mut failures = 0u32;
        let mut best_progress = session.as_ref().map_or(0, |s| s.bytes_confirmed);
        let mut rejected_once = false;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let step = async {
                let credential = self
                    .credentials
                    .get_valid_token()
                    .await
                    .map_err(|error| StepFailure { error, token: None })?;
                let token = credential.bearer().to_string();
                self.step(
                    &token,
                    &object,
                    &mut file,
                    &mut *session,
                    needs_query,
                    chunk_size,
                    &mut report,
                    observer,
                )
                .await
                .map_err(|error| StepFailure {
                    error,
                    token: Some(token),
                })
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = step => result,
            };

            match result {
                Ok(Some(remote_id)) => {
                    report.remote_id = remote_id;
                    info!(
                        "Uploaded {} ({} bytes, {} chunks, {} retries)",
                        snapshot.name, snapshot.size_bytes, report.chunks_sent, report.retries
                    );
                    return Ok(report);
                }
                Ok(None) => {
                    if needs_query && resuming {
                        report.resumed_from = session.as_ref().map_or(0, |s| s.bytes_confirmed);
                        if report.resumed_from > 0 {
                            info!(
                                "Resuming upload of {} at byte {}",
                                snapshot.name, report.resumed_from
                            );
                        }
                        resuming = false;
                    }
                    needs_query = false;
                    rejected_once = false;

                    let confirmed = session.as_ref().map_or(0, |s| s.bytes_confirmed);
                    if confirmed > best_progress {
                        best_progress = confirmed;
                        failures = 0;
                    }
                }
                Err(StepFailure {
                    error: Error::Unauthorized(msg),
                    token: Some(token),
                }) => {
                    if rejected_once {
                        return Err(Error::AuthenticationRequired(msg));
                    }
                    rejected_once = true;
                    debug!("Access token rejected during upload, refreshing");
                    match self.credentials.refresh_if_stale(&token).await {
                        Ok(_) => {}
                        Err(e) if e.is_transient() => {
                            self.back_off(&mut failures, &mut report, e, cancel).await?;
                        }
                        Err(e) => return Err(e),
                    }
                    needs_query = session.is_some();
                }
                Err(StepFailure {
                    error: Error::SessionExpired(msg),
                    ..
                }) => {
                    warn!("Upload session expired ({}), restarting at offset 0", msg);
                    *session = None;
                    observer.session_updated(None).await?;
                    best_progress = 0;
                    resuming = false;
                    needs_query = false;
                    self.back_off(&mut failures, &mut report, Error::SessionExpired(msg), cancel)
                        .await?;
                }
                Err(StepFailure { error, .. }) if error.is_transient() => {
                    self.back_off(&mut failures, &mut report, error, cancel).await?;
                    needs_query = session.is_some();
                }
                Err(StepFailure { error, .. }) => return Err(error),
            }
        }
    }

    /// Count a failure and wait before the next try.
    async fn back_off(
        &self,
        failures: &mut u32,
        report: &mut UploadReport,
        cause: Error,
        cancel: &CancellationToken,
    ) -> Result<()> {
        *failures += 1;
        if *failures > self.retry.max_retries {
            warn!("Upload giving up after {} failures: {}", failures, cause);
            return Err(Error::upload_failed(*failures, cause));
        }

        report.retries += 1;
        let delay = self.retry.delay_for_attempt(*failures - 1);
        warn!(
            "Upload attempt failed ({}), retry {}/{} in {:?}",
            cause, failures, self.retry.max_retries, delay
        );
        sleep_or_cancel(delay, cancel).await
    }

    /// One remote round trip: create, query or send a chunk.
    ///
    /// Returns the remote id once the object is complete.
    #[allow(clippy::too_many_arguments)]
    async fn step(
        &self,
        token: &str,
        object: &ObjectSpec,
        file: &mut File,
        session: &mut Option<UploadSession>,
        needs_query: bool,
        chunk_size: u64,
        report: &mut UploadReport,
        observer: &dyn SessionObserver,
    ) -> Result<Option<String>> {
        let Some(current) = session.as_ref() else {
            let remote = self.store.create_session(token, object).await?;
            debug!("Created upload session {}", remote.session_uri);
            let created = UploadSession {
                remote,
                bytes_confirmed: 0,
                snapshot_checksum: object.checksum.clone(),
                total_size: object.size_bytes,
            };
            report.sessions_created += 1;
            *session = Some(created);
            observer.session_updated(session.as_ref()).await?;
            return Ok(None);
        };

        let total = current.total_size;
        let ack = if needs_query {
            self.store.query_session(token, &current.remote, total).await?
        } else {
            let offset = current.bytes_confirmed;
            let len = chunk_size.min(total.saturating_sub(offset));
            let data = read_chunk(file, offset, len).await?;

            let ack = self
                .store
                .upload_chunk(token, &current.remote, offset, &data, total)
                .await?;
            report.chunks_sent += 1;
            report.bytes_sent += len;
            debug!("Sent {} bytes at offset {} of {}", len, offset, total);
            ack
        };

        match ack {
            ChunkAck::Complete { remote_id } => Ok(Some(remote_id)),
            ChunkAck::Incomplete { bytes_confirmed } => {
                if bytes_confirmed < current.bytes_confirmed {
                    return Err(Error::SessionExpired(format!(
                        "remote reports {} bytes after acknowledging {}",
                        bytes_confirmed, current.bytes_confirmed
                    )));
                }
                if bytes_confirmed > total {
                    return Err(Error::InvalidInput(format!(
                        "remote acknowledged {} of {} bytes",
                        bytes_confirmed, total
                    )));
                }

                if !needs_query && bytes_confirmed == current.bytes_confirmed {
                    // Counted as a failed round trip so a stalled remote
                    // exhausts the retry budget instead of spinning.
                    return Err(Error::Network(format!(
                        "remote stored no new bytes past offset {}",
                        bytes_confirmed
                    )));
                }

                if bytes_confirmed != current.bytes_confirmed {
                    let mut updated = current.clone();
                    updated.bytes_confirmed = bytes_confirmed;
                    *session = Some(updated);
                    observer.session_updated(session.as_ref()).await?;
                }
                Ok(None)
            }
        }
    }
}

async fn read_chunk(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len)
        .map_err(|_| Error::InvalidInput(format!("chunk of {} bytes is too large", len)))?;
    let mut data = vec![0u8; len];
    file.seek(SeekFrom::Start(offset)).await?;
    file.read_exact(&mut data).await?;
    Ok(data)
}

/// A failed step, with the token it used so a rejection can name the
/// token to replace.
struct StepFailure {
    error: Error,
    token: Option<String>,
}
