//! Backup orchestrator: drives jobs through archive, upload and prune.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use worldback_common::{Error, JobId, Result};
use worldback_storage::RemoteStore;

use crate::archiver::{ArchiveOptions, Archiver, Quiescence, Snapshot};
use crate::checkpoint::{path_digest, CheckpointStore, JobCheckpoint};
use crate::config::{BackupConfig, TriggerPolicy};
use crate::credentials::CredentialStore;
use crate::job::{BackupJob, JobState};
use crate::retention::RetentionManager;
use crate::retry::{sleep_or_cancel, RetryExecutor};
use crate::upload::{SessionObserver, UploadManager, UploadSession};

const EVENT_CAPACITY: usize = 64;

/// Answer to a backup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new job was started.
    Started(JobId),
    /// A job is already active; the request was dropped.
    Coalesced,
    /// A job is already active; one more will run after it.
    Queued,
}

/// Host-visible status of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Stage of the current or most recent job.
    pub state: JobState,
    /// Most recent failure of that job.
    pub last_error: Option<String>,
    /// When a backup of this source last completed.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Attempt number of the current or most recent job.
    pub attempt: u32,
    /// Current or most recent job.
    pub job_id: Option<JobId>,
    /// Remote id of the most recent completed backup.
    pub last_remote_id: Option<String>,
    /// Another job is queued behind the current one.
    pub queued: bool,
}

impl JobStatus {
    fn idle() -> Self {
        Self {
            state: JobState::Idle,
            last_error: None,
            last_success_at: None,
            attempt: 0,
            job_id: None,
            last_remote_id: None,
            queued: false,
        }
    }

    /// Whether work for this source is still outstanding.
    pub fn is_busy(&self) -> bool {
        self.state.is_active() || self.queued
    }
}

/// Notification sent to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    /// A job moved to a new stage.
    StateChanged {
        source: PathBuf,
        job_id: JobId,
        state: JobState,
    },
    /// A job stored its snapshot remotely.
    Completed {
        source: PathBuf,
        job_id: JobId,
        remote_id: String,
        pruned: usize,
    },
    /// A job gave up.
    Abandoned {
        source: PathBuf,
        job_id: JobId,
        error: String,
    },
}

struct ActiveJob {
    id: JobId,
    cancel: CancellationToken,
}

struct Slot {
    status: watch::Sender<JobStatus>,
    active: Option<ActiveJob>,
    pending: bool,
}

impl Slot {
    fn new() -> Self {
        let (status, _) = watch::channel(JobStatus::idle());
        Self {
            status,
            active: None,
            pending: false,
        }
    }
}

/// Staged artifacts carried between attempts of one job.
#[derive(Default)]
struct JobArtifacts {
    snapshot: Option<Snapshot>,
    session: Option<UploadSession>,
    /// Remote id once the upload finished; later attempts only prune.
    uploaded: Option<String>,
}

struct Inner {
    config: BackupConfig,
    archiver: Archiver,
    uploader: UploadManager,
    retention: RetentionManager,
    checkpoints: CheckpointStore,
    slots: Mutex<HashMap<PathBuf, Slot>>,
    events: broadcast::Sender<BackupEvent>,
    runtime: Handle,
    shutdown: CancellationToken,
}

/// Runs backup jobs, one at a time per source directory.
///
/// Requests, status queries and cancellation are synchronous so a host
/// can call them from its own event loop; jobs run on the tokio runtime
/// the orchestrator was created on.
#[derive(Clone)]
pub struct BackupOrchestrator {
    inner: Arc<Inner>,
}

impl BackupOrchestrator {
    /// Create an orchestrator on the current tokio runtime.
    ///
    /// # Errors
    /// - `InvalidInput` if the configuration is invalid or no runtime is running
    pub fn new(
        config: BackupConfig,
        store: Arc<dyn RemoteStore>,
        credentials: Arc<CredentialStore>,
        quiescence: Arc<dyn Quiescence>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::InvalidInput(format!("No tokio runtime: {}", e)))?;

        let archiver = Archiver::new(
            config.staging_dir.clone(),
            ArchiveOptions {
                max_read_retries: config.max_read_retries,
                quiescence_timeout: config.quiescence_timeout,
            },
            quiescence,
        );
        let uploader = UploadManager::new(
            store.clone(),
            credentials.clone(),
            config.chunk_size,
            config.retry.clone(),
        );
        let retention = RetentionManager::new(
            store,
            credentials,
            Arc::new(RetryExecutor::new(config.retry.clone())),
        );
        let checkpoints = CheckpointStore::new(&config.staging_dir);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                archiver,
                uploader,
                retention,
                checkpoints,
                slots: Mutex::new(HashMap::new()),
                events,
                runtime,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &BackupConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Retention manager bound to the same store and credentials.
    pub fn retention(&self) -> &RetentionManager {
        &self.inner.retention
    }

    /// Ask for a backup of `source`.
    ///
    /// # Errors
    /// - `NotPermitted` after [`shutdown`](Self::shutdown)
    pub fn request_backup(&self, source: impl AsRef<Path>) -> Result<RequestOutcome> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::NotPermitted("Orchestrator is shutting down".to_string()));
        }

        let key = source_key(source.as_ref());
        let mut slots = self.inner.lock_slots();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);

        if slot.active.is_some() {
            return Ok(match self.inner.config.trigger_policy {
                TriggerPolicy::Coalesce => {
                    debug!("Backup of {:?} already running; request coalesced", key);
                    RequestOutcome::Coalesced
                }
                TriggerPolicy::Queue => {
                    slot.pending = true;
                    slot.status.send_modify(|s| s.queued = true);
                    debug!("Backup of {:?} already running; request queued", key);
                    RequestOutcome::Queued
                }
            });
        }

        let job = BackupJob::new(&key);
        let id = job.id;
        self.inner.start_job(slot, key, job, JobArtifacts::default());
        Ok(RequestOutcome::Started(id))
    }

    /// Current status of `source`.
    pub fn status(&self, source: impl AsRef<Path>) -> JobStatus {
        let key = source_key(source.as_ref());
        self.inner
            .lock_slots()
            .get(&key)
            .map(|slot| slot.status.borrow().clone())
            .unwrap_or_else(JobStatus::idle)
    }

    /// Cancel the active job of `source` and drop any queued request.
    ///
    /// Returns whether a job was active.
    pub fn cancel(&self, source: impl AsRef<Path>) -> bool {
        let key = source_key(source.as_ref());
        let mut slots = self.inner.lock_slots();
        let Some(slot) = slots.get_mut(&key) else {
            return false;
        };

        slot.pending = false;
        match &slot.active {
            Some(active) => {
                info!("Cancelling backup job {} for {:?}", active.id, key);
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until `source` has no active or queued job and return its status.
    pub async fn wait(&self, source: impl AsRef<Path>) -> JobStatus {
        let key = source_key(source.as_ref());
        let receiver = self
            .inner
            .lock_slots()
            .get(&key)
            .map(|slot| slot.status.subscribe());

        let Some(mut receiver) = receiver else {
            return JobStatus::idle();
        };
        if let Ok(status) = receiver.wait_for(|status| !status.is_busy()).await {
            return status.clone();
        }
        let status = receiver.borrow().clone();
        status
    }

    /// Receive job notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.inner.events.subscribe()
    }

    /// Resume every job interrupted by a previous shutdown or crash.
    ///
    /// Jobs whose snapshot is still staged continue uploading. A job whose
    /// upload the remote already finished goes straight to pruning. The
    /// rest start over from archiving. When no job is running, staging
    /// leftovers that no resumed job needs are removed first, so call this
    /// before requesting backups.
    pub async fn recover(&self) -> Result<Vec<JobId>> {
        let checkpoints = self.inner.checkpoints.load_all().await?;
        let mut plans = Vec::new();
        let mut keep = Vec::new();

        for checkpoint in checkpoints {
            if matches!(
                checkpoint.state,
                JobState::Pruning | JobState::Completed | JobState::Abandoned
            ) {
                debug!("Dropping checkpoint of finished job {}", checkpoint.job_id);
                if let Some(snapshot) = &checkpoint.snapshot {
                    if let Err(e) = snapshot.discard() {
                        warn!("Failed to remove staged snapshot {:?}: {}", snapshot.path, e);
                    }
                }
                self.inner.checkpoints.remove(&checkpoint.source_path).await?;
                continue;
            }

            let artifacts = self.inner.recovered_artifacts(&checkpoint).await;
            if let Some(snapshot) = &artifacts.snapshot {
                keep.push(snapshot.path.clone());
            }
            plans.push((checkpoint, artifacts));
        }

        let idle = !self
            .inner
            .lock_slots()
            .values()
            .any(|slot| slot.active.is_some());
        if idle {
            if let Err(e) = self.inner.archiver.sweep_staging(keep).await {
                warn!("Failed to sweep staging directory: {}", e);
            }
        }

        let mut resumed = Vec::new();
        for (checkpoint, artifacts) in plans {
            let key = checkpoint.source_path;
            let mut slots = self.inner.lock_slots();
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            if slot.active.is_some() {
                debug!("{:?} already has an active job; not recovering", key);
                continue;
            }

            let mut job = BackupJob::new(&key);
            job.id = checkpoint.job_id;
            job.attempt = checkpoint.attempt.saturating_sub(1);

            resumed.push(job.id);
            self.inner.start_job(slot, key, job, artifacts);
        }

        Ok(resumed)
    }

    /// Cancel every active job, refuse new requests and wait for jobs to stop.
    ///
    /// Interrupted uploads keep their checkpoint for [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let receivers: Vec<watch::Receiver<JobStatus>> = {
            let mut slots = self.inner.lock_slots();
            slots
                .values_mut()
                .map(|slot| {
                    slot.pending = false;
                    slot.status.subscribe()
                })
                .collect()
        };

        for mut receiver in receivers {
            let _ = receiver.wait_for(|status| !status.state.is_active()).await;
        }
        info!("Backup orchestrator stopped");
    }
}

impl Inner {
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<PathBuf, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `job` active in `slot` and spawn it. Caller holds the slot lock.
    fn start_job(
        self: &Arc<Self>,
        slot: &mut Slot,
        key: PathBuf,
        mut job: BackupJob,
        artifacts: JobArtifacts,
    ) {
        let cancel = self.shutdown.child_token();
        slot.active = Some(ActiveJob {
            id: job.id,
            cancel: cancel.clone(),
        });

        if let Err(e) = job.transition(JobState::Archiving) {
            warn!("{}", e);
        }
        let queued = slot.pending;
        slot.status.send_modify(|s| {
            s.state = job.state;
            s.last_error = None;
            s.attempt = job.attempt;
            s.job_id = Some(job.id);
            s.queued = queued;
        });
        info!("Started backup job {} for {:?}", job.id, key);

        let inner = self.clone();
        self.runtime.spawn(async move {
            let (job, remote_id) = inner.run_job(job, artifacts, cancel).await;
            inner.finish(&key, job, remote_id);
        });
    }

    /// Publish the end of a job and start a queued one.
    fn finish(self: &Arc<Self>, key: &Path, job: BackupJob, remote_id: Option<String>) {
        let mut slots = self.lock_slots();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };

        slot.active = None;
        let queued = slot.pending && !self.shutdown.is_cancelled();
        slot.pending = false;

        slot.status.send_modify(|s| {
            s.state = job.state;
            s.last_error = job.last_error.clone();
            s.attempt = job.attempt;
            s.job_id = Some(job.id);
            s.queued = queued;
            if let Some(remote_id) = &remote_id {
                s.last_success_at = Some(Utc::now());
                s.last_remote_id = Some(remote_id.clone());
            }
        });

        if queued {
            let next = BackupJob::new(key);
            self.start_job(slot, key.to_path_buf(), next, JobArtifacts::default());
        }
    }

    /// Terminal states reach the status only through `finish`, together
    /// with the outcome.
    fn publish(&self, job: &BackupJob) {
        if !job.state.is_terminal() {
            if let Some(slot) = self.lock_slots().get(&job.source_path) {
                slot.status.send_modify(|s| {
                    s.state = job.state;
                    s.last_error = job.last_error.clone();
                    s.attempt = job.attempt;
                });
            }
        }
        let _ = self.events.send(BackupEvent::StateChanged {
            source: job.source_path.clone(),
            job_id: job.id,
            state: job.state,
        });
    }

    /// Decide where a recovered job picks up.
    async fn recovered_artifacts(&self, checkpoint: &JobCheckpoint) -> JobArtifacts {
        if checkpoint.can_resume_upload() {
            info!(
                "Recovering job {} for {:?}: resuming upload",
                checkpoint.job_id, checkpoint.source_path
            );
            return JobArtifacts {
                snapshot: checkpoint.snapshot.clone(),
                session: checkpoint.session.clone(),
                uploaded: None,
            };
        }

        if let Some(session) = &checkpoint.session {
            match self.uploader.completed_remote_id(session).await {
                Ok(Some(remote_id)) => {
                    info!(
                        "Recovering job {} for {:?}: upload already stored as {}",
                        checkpoint.job_id, checkpoint.source_path, remote_id
                    );
                    return JobArtifacts {
                        uploaded: Some(remote_id),
                        ..JobArtifacts::default()
                    };
                }
                Ok(None) => debug!("Upload of job {} was not finished", checkpoint.job_id),
                Err(e) => warn!(
                    "Could not query upload session of job {}: {}",
                    checkpoint.job_id, e
                ),
            }
        }

        info!(
            "Recovering job {} for {:?}: archiving again",
            checkpoint.job_id, checkpoint.source_path
        );
        JobArtifacts::default()
    }

    fn advance(&self, job: &mut BackupJob, next: JobState) -> Result<()> {
        job.transition(next)?;
        debug!("Job {} -> {}", job.id, next);
        self.publish(job);
        Ok(())
    }

    async fn checkpoint(&self, job: &BackupJob, artifacts: &JobArtifacts) -> Result<()> {
        let checkpoint = JobCheckpoint {
            job_id: job.id,
            source_path: job.source_path.clone(),
            state: job.state,
            attempt: job.attempt,
            snapshot: artifacts.snapshot.clone(),
            session: artifacts.session.clone(),
            updated_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint).await
    }

    /// Run `job` (already in `Archiving`) to a terminal state.
    async fn run_job(
        &self,
        mut job: BackupJob,
        mut artifacts: JobArtifacts,
        cancel: CancellationToken,
    ) -> (BackupJob, Option<String>) {
        self.publish(&job);

        loop {
            let error = match self.run_attempt(&mut job, &mut artifacts, &cancel).await {
                Ok((remote_id, pruned)) => {
                    let _ = self.events.send(BackupEvent::Completed {
                        source: job.source_path.clone(),
                        job_id: job.id,
                        remote_id: remote_id.clone(),
                        pruned,
                    });
                    return (job, Some(remote_id));
                }
                Err(e) => e,
            };

            if error.is_cancelled() {
                self.abandon_cancelled(&mut job, &mut artifacts).await;
                return (job, None);
            }

            warn!(
                "Backup job {} attempt {} failed in {}: {}",
                job.id, job.attempt, job.state, error
            );
            if let Err(e) = job.fail(error.to_string()) {
                error!("{}", e);
            }
            self.publish(&job);
            if let Err(e) = self.checkpoint(&job, &artifacts).await {
                warn!("Failed to checkpoint job {}: {}", job.id, e);
            }

            if !job.should_retry(self.config.max_attempts) {
                self.abandon(&mut job, &mut artifacts).await;
                return (job, None);
            }

            let delay = self.config.retry.delay_for_attempt(job.attempt.saturating_sub(1));
            info!("Retrying backup job {} in {:?}", job.id, delay);
            if sleep_or_cancel(delay, &cancel).await.is_err() {
                self.abandon_cancelled(&mut job, &mut artifacts).await;
                return (job, None);
            }
            if let Err(e) = self.advance(&mut job, JobState::Archiving) {
                error!("{}", e);
                return (job, None);
            }
        }
    }

    /// One pass through archive, upload and prune.
    async fn run_attempt(
        &self,
        job: &mut BackupJob,
        artifacts: &mut JobArtifacts,
        cancel: &CancellationToken,
    ) -> Result<(String, usize)> {
        let source = job.source_path.clone();
        let source_id = source_id(&source);

        let remote_id = match artifacts.uploaded.clone() {
            Some(remote_id) => {
                info!("Job {} already uploaded {}", job.id, remote_id);
                self.advance(job, JobState::Uploading)?;
                remote_id
            }
            None => {
                self.archive_and_upload(job, artifacts, &source_id, cancel)
                    .await?
            }
        };
        artifacts.session = None;
        artifacts.uploaded = Some(remote_id.clone());
        let uploaded = artifacts.snapshot.take();

        // Pruning. The checkpoint must stop naming the snapshot before the
        // file goes, or a crash in between would upload it again.
        self.advance(job, JobState::Pruning)?;
        if let Err(e) = self.checkpoint(job, artifacts).await {
            warn!("Failed to checkpoint job {}: {}", job.id, e);
        }
        if let Some(snapshot) = uploaded {
            if let Err(e) = snapshot.discard() {
                warn!("Failed to remove staged snapshot {:?}: {}", snapshot.path, e);
            }
        }

        let pruned = match self
            .retention
            .prune(&source_id, &self.config.retention, Some(&remote_id), cancel)
            .await
        {
            Ok(prune) => {
                for (id, reason) in &prune.failures {
                    warn!("Could not prune {}: {}", id, reason);
                }
                prune.deleted.len()
            }
            Err(e) => {
                warn!("Retention for {} failed: {}", source_id, e);
                0
            }
        };

        self.advance(job, JobState::Completed)?;
        if let Err(e) = self.checkpoints.remove(&source).await {
            warn!("Failed to remove checkpoint for {:?}: {}", source, e);
        }
        info!("Backup job {} completed: stored as {}", job.id, remote_id);
        Ok((remote_id, pruned))
    }

    /// Archive the source, or reuse the staged snapshot, and upload it.
    async fn archive_and_upload(
        &self,
        job: &mut BackupJob,
        artifacts: &mut JobArtifacts,
        source_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let source = job.source_path.clone();

        // Archiving
        self.checkpoint(job, artifacts).await?;
        let snapshot = match artifacts.snapshot.take() {
            Some(staged) if staged.is_staged() => {
                info!("Reusing staged snapshot {}", staged.name);
                staged
            }
            _ => {
                artifacts.session = None;
                self.archiver
                    .archive(&source, &self.config.exclude_patterns, cancel)
                    .await?
            }
        };
        artifacts.snapshot = Some(snapshot.clone());

        // Uploading
        self.advance(job, JobState::Uploading)?;
        self.checkpoint(job, artifacts).await?;

        let observer = CheckpointObserver {
            checkpoints: &self.checkpoints,
            base: Mutex::new(JobCheckpoint {
                job_id: job.id,
                source_path: source,
                state: job.state,
                attempt: job.attempt,
                snapshot: Some(snapshot.clone()),
                session: artifacts.session.clone(),
                updated_at: Utc::now(),
            }),
        };
        let report = self
            .uploader
            .upload(source_id, &snapshot, &mut artifacts.session, &observer, cancel)
            .await?;
        Ok(report.remote_id)
    }

    /// End a cancelled job. A staged snapshot and its checkpoint are kept
    /// so [`BackupOrchestrator::recover`] can finish the upload.
    async fn abandon_cancelled(&self, job: &mut BackupJob, artifacts: &mut JobArtifacts) {
        job.last_error = Some(Error::Cancelled.to_string());
        let resumable = artifacts.snapshot.as_ref().is_some_and(Snapshot::is_staged);

        if resumable {
            if let Err(e) = self.checkpoint(job, artifacts).await {
                warn!("Failed to checkpoint job {}: {}", job.id, e);
            }
        } else if let Err(e) = self.checkpoints.remove(&job.source_path).await {
            warn!("Failed to remove checkpoint for {:?}: {}", job.source_path, e);
        }

        if let Err(e) = job.transition(JobState::Abandoned) {
            error!("{}", e);
        }
        self.publish(job);
        info!("Backup job {} cancelled", job.id);
        let _ = self.events.send(BackupEvent::Abandoned {
            source: job.source_path.clone(),
            job_id: job.id,
            error: Error::Cancelled.to_string(),
        });
    }

    /// Give up on `job` and clean up its staged artifacts.
    async fn abandon(&self, job: &mut BackupJob, artifacts: &mut JobArtifacts) {
        if let Some(snapshot) = artifacts.snapshot.take() {
            if let Err(e) = snapshot.discard() {
                warn!("Failed to remove staged snapshot {:?}: {}", snapshot.path, e);
            }
        }
        artifacts.session = None;
        if let Err(e) = self.checkpoints.remove(&job.source_path).await {
            warn!("Failed to remove checkpoint for {:?}: {}", job.source_path, e);
        }

        if let Err(e) = job.transition(JobState::Abandoned) {
            error!("{}", e);
        }
        self.publish(job);

        let reason = job.last_error.clone().unwrap_or_default();
        error!(
            "Backup job {} abandoned after {} attempts: {}",
            job.id, job.attempt, reason
        );
        let _ = self.events.send(BackupEvent::Abandoned {
            source: job.source_path.clone(),
            job_id: job.id,
            error: reason,
        });
    }
}

/// Writes the job checkpoint whenever the upload session changes.
struct CheckpointObserver<'a> {
    checkpoints: &'a CheckpointStore,
    base: Mutex<JobCheckpoint>,
}

#[async_trait]
impl SessionObserver for CheckpointObserver<'_> {
    async fn session_updated(&self, session: Option<&UploadSession>) -> Result<()> {
        let checkpoint = {
            let mut base = self.base.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            base.session = session.cloned();
            base.clone()
        };
        self.checkpoints.save(&checkpoint).await
    }
}

/// Mutual-exclusion key for a source directory.
fn source_key(source: &Path) -> PathBuf {
    std::fs::canonicalize(source).unwrap_or_else(|_| source.to_path_buf())
}

/// Display name of `source`: its last path component.
pub fn source_name(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string_lossy().into_owned())
}

/// Identity under which versions of `source` are stored and pruned.
///
/// The directory name keeps it readable; a digest of the canonical path
/// keeps two directories with the same name apart.
pub fn source_id(source: &Path) -> String {
    let key = source_key(source);
    format!("{}-{}", source_name(&key), path_digest(&key, 6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::NoQuiescence;
    use crate::retention::RetentionPolicy;
    use crate::retry::RetryConfig;
    use std::time::Duration;
    use tempfile::TempDir;
    use worldback_storage::MemoryStore;

    fn world(temp: &TempDir) -> PathBuf {
        let root = temp.path().join("world");
        std::fs::create_dir_all(root.join("region")).unwrap();
        std::fs::write(root.join("level.dat"), vec![1u8; 3000]).unwrap();
        std::fs::write(root.join("region").join("r.0.0.mca"), vec![2u8; 5000]).unwrap();
        root
    }

    fn config(temp: &TempDir) -> BackupConfig {
        BackupConfig {
            staging_dir: temp.path().join("staging"),
            chunk_size: 1024,
            retry: RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
            retention: RetentionPolicy::keep_last(5, 2),
            ..BackupConfig::default()
        }
    }

    fn orchestrator(config: BackupConfig, store: &MemoryStore) -> BackupOrchestrator {
        BackupOrchestrator::new(
            config,
            Arc::new(store.clone()),
            Arc::new(CredentialStore::anonymous()),
            Arc::new(NoQuiescence),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_backup_completes() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let store = MemoryStore::new();
        let orchestrator = orchestrator(config(&temp), &store);

        let outcome = orchestrator.request_backup(&source).unwrap();
        let RequestOutcome::Started(job_id) = outcome else {
            panic!("expected a started job");
        };

        let status = orchestrator.wait(&source).await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.job_id, Some(job_id));
        assert_eq!(status.attempt, 1);
        assert!(status.last_success_at.is_some());
        assert!(status.last_error.is_none());

        let versions = store.versions(&source_id(&source));
        assert_eq!(versions.len(), 1);
        assert_eq!(status.last_remote_id.as_deref(), Some(versions[0].remote_id.as_str()));

        // Staging holds neither snapshot nor checkpoint afterwards.
        let staging = temp.path().join("staging");
        assert_eq!(std::fs::read_dir(staging.join("snapshots")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(staging.join("checkpoints")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_status_of_unknown_source_is_idle() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&temp), &MemoryStore::new());

        let status = orchestrator.status(temp.path().join("nothing"));
        assert_eq!(status.state, JobState::Idle);
        assert!(!orchestrator.cancel(temp.path().join("nothing")));
    }

    #[tokio::test]
    async fn test_duplicate_request_is_coalesced() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let store = MemoryStore::new();
        let orchestrator = orchestrator(config(&temp), &store);

        assert!(matches!(
            orchestrator.request_backup(&source).unwrap(),
            RequestOutcome::Started(_)
        ));
        assert_eq!(
            orchestrator.request_backup(&source).unwrap(),
            RequestOutcome::Coalesced
        );

        orchestrator.wait(&source).await;
        assert_eq!(store.versions(&source_id(&source)).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_request_is_queued() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let store = MemoryStore::new();
        let mut config = config(&temp);
        config.trigger_policy = TriggerPolicy::Queue;
        let orchestrator = orchestrator(config, &store);

        orchestrator.request_backup(&source).unwrap();
        assert_eq!(orchestrator.request_backup(&source).unwrap(), RequestOutcome::Queued);
        assert_eq!(orchestrator.request_backup(&source).unwrap(), RequestOutcome::Queued);

        let status = orchestrator.wait(&source).await;
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(store.versions(&source_id(&source)).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_is_abandoned_after_max_attempts() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone");
        let orchestrator = orchestrator(config(&temp), &MemoryStore::new());
        let mut events = orchestrator.subscribe();

        orchestrator.request_backup(&missing).unwrap();
        let status = orchestrator.wait(&missing).await;

        assert_eq!(status.state, JobState::Abandoned);
        assert_eq!(status.attempt, 3);
        assert!(status.last_error.unwrap().contains("Source unavailable"));

        let mut abandoned = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BackupEvent::Abandoned { .. }) {
                abandoned = true;
            }
        }
        assert!(abandoned);
    }

    #[tokio::test]
    async fn test_cancel_during_upload_keeps_checkpoint() {
        let temp = TempDir::new().unwrap();
        let source = world(&temp);
        let store = MemoryStore::new();
        store.fail_next_chunks(1_000);
        let mut config = config(&temp);
        config.retry = RetryConfig::new(100)
            .with_initial_delay(Duration::from_secs(30))
            .with_jitter(false);
        let orchestrator = orchestrator(config, &store);
        let mut events = orchestrator.subscribe();

        orchestrator.request_backup(&source).unwrap();
        loop {
            match events.recv().await.unwrap() {
                BackupEvent::StateChanged {
                    state: JobState::Uploading,
                    ..
                } => break,
                _ => continue,
            }
        }
        // Let the first chunk fail and the backoff start.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orchestrator.cancel(&source));
        let status = orchestrator.wait(&source).await;
        assert_eq!(status.state, JobState::Abandoned);
        assert_eq!(status.last_error.as_deref(), Some("Operation cancelled"));

        let checkpoints = CheckpointStore::new(temp.path().join("staging"));
        let saved = checkpoints.load_all().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].can_resume_upload());
        assert!(saved[0].session.is_some());
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_are_refused() {
        let temp = TempDir::new().unwrap();
        let orchestrator = orchestrator(config(&temp), &MemoryStore::new());

        orchestrator.shutdown().await;
        assert!(matches!(
            orchestrator.request_backup(temp.path()),
            Err(Error::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn test_same_named_sources_keep_separate_histories() {
        let temp = TempDir::new().unwrap();
        let make = |dir: &str| {
            let root = temp.path().join(dir).join("world");
            std::fs::create_dir_all(&root).unwrap();
            std::fs::write(root.join("level.dat"), dir.as_bytes()).unwrap();
            root
        };
        let source_a = make("saves_a");
        let source_b = make("saves_b");
        let store = MemoryStore::new();
        let mut config = config(&temp);
        config.retention = RetentionPolicy::keep_last(2, 1);
        let orchestrator = orchestrator(config, &store);

        orchestrator.request_backup(&source_b).unwrap();
        assert_eq!(orchestrator.wait(&source_b).await.state, JobState::Completed);
        for _ in 0..3 {
            orchestrator.request_backup(&source_a).unwrap();
            assert_eq!(orchestrator.wait(&source_a).await.state, JobState::Completed);
        }

        assert_ne!(source_id(&source_a), source_id(&source_b));
        assert_eq!(store.versions(&source_id(&source_a)).len(), 2);
        assert_eq!(store.versions(&source_id(&source_b)).len(), 1);
        assert_eq!(store.object_count(), 3);
    }

    #[tokio::test]
    async fn test_recover_sweeps_staging_leftovers() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        let snapshots = staging.join("snapshots");
        let capture = staging.join("capture").join("interrupted");
        std::fs::create_dir_all(&snapshots).unwrap();
        std::fs::create_dir_all(&capture).unwrap();
        std::fs::write(snapshots.join("world-20250101-000000-0a1b2c3d.zip"), b"zip").unwrap();
        std::fs::write(snapshots.join("world-20250101-000000-4e5f6a7b.zip.tmp"), b"zi").unwrap();
        std::fs::write(capture.join("level.dat"), b"level").unwrap();

        let orchestrator = orchestrator(config(&temp), &MemoryStore::new());
        let resumed = orchestrator.recover().await.unwrap();

        assert!(resumed.is_empty());
        assert_eq!(std::fs::read_dir(&snapshots).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(staging.join("capture")).unwrap().count(), 0);
    }

    #[test]
    fn test_source_name() {
        assert_eq!(source_name(Path::new("/saves/My World")), "My World");
    }

    #[test]
    fn test_source_id_tells_same_named_directories_apart() {
        let a = source_id(Path::new("/saves/a/world"));
        let b = source_id(Path::new("/saves/b/world"));

        assert!(a.starts_with("world-"));
        assert_eq!(a.len(), "world-".len() + 12);
        assert_ne!(a, b);
        assert_eq!(a, source_id(Path::new("/saves/a/world")));
    }
}
