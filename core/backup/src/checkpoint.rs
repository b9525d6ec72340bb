//! Durable job checkpoints for crash recovery.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use worldback_common::{Error, JobId, Result};

use crate::archiver::Snapshot;
use crate::job::JobState;
use crate::upload::UploadSession;

const CHECKPOINTS_DIRNAME: &str = "checkpoints";

/// Everything needed to continue a job after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCheckpoint {
    /// Job being checkpointed.
    pub job_id: JobId,
    /// Source directory.
    pub source_path: PathBuf,
    /// Stage at the time of the checkpoint.
    pub state: JobState,
    /// Attempt number at the time of the checkpoint.
    pub attempt: u32,
    /// Staged snapshot, once archiving finished.
    pub snapshot: Option<Snapshot>,
    /// Upload session, once one was created.
    pub session: Option<UploadSession>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl JobCheckpoint {
    /// Checkpoint for a job that has just been triggered.
    pub fn new(job_id: JobId, source_path: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            source_path: source_path.into(),
            state: JobState::Idle,
            attempt: 0,
            snapshot: None,
            session: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the upload can pick up where it left off.
    pub fn can_resume_upload(&self) -> bool {
        self.snapshot.as_ref().is_some_and(Snapshot::is_staged)
    }
}

/// Checkpoint files under `<staging>/checkpoints`, one per source.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Create a store under `staging_dir`.
    pub fn new(staging_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: staging_dir.as_ref().join(CHECKPOINTS_DIRNAME),
        }
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, source: &Path) -> PathBuf {
        self.dir.join(format!("{}.json", path_digest(source, 16)))
    }

    /// Write `checkpoint` atomically, replacing the previous one.
    pub async fn save(&self, checkpoint: &JobCheckpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut checkpoint = checkpoint.clone();
        checkpoint.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let path = self.path_for(&checkpoint.source_path);
        tokio::task::spawn_blocking(move || crate::config::write_atomic(&path, &json))
            .await
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!(
            "Checkpointed job {} at {}",
            checkpoint.job_id, checkpoint.state
        );
        Ok(())
    }

    /// Load the checkpoint for `source`, if any.
    pub async fn load(&self, source: &Path) -> Result<Option<JobCheckpoint>> {
        match fs::read_to_string(self.path_for(source)).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| Error::Serialization(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Every readable checkpoint. Corrupt files are skipped.
    pub async fn load_all(&self) -> Result<Vec<JobCheckpoint>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<JobCheckpoint>(&content) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!("Ignoring unreadable checkpoint {:?}: {}", path, e),
            }
        }

        checkpoints.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(checkpoints)
    }

    /// Delete the checkpoint for `source`.
    pub async fn remove(&self, source: &Path) -> Result<()> {
        match fs::remove_file(self.path_for(source)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Hex of the first `len` bytes of the BLAKE2b-256 of `path`.
pub(crate) fn path_digest(path: &Path, len: usize) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..len.min(digest.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use worldback_storage::RemoteSession;

    fn session() -> UploadSession {
        UploadSession {
            remote: RemoteSession {
                session_uri: "memory://upload/1".to_string(),
                expires_at: Utc::now(),
            },
            bytes_confirmed: 2048,
            snapshot_checksum: "abc".to_string(),
            total_size: 4096,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let source = Path::new("/worlds/alpha");

        let mut checkpoint = JobCheckpoint::new(JobId::new(), source);
        checkpoint.state = JobState::Uploading;
        checkpoint.session = Some(session());
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load(source).await.unwrap().unwrap();
        assert_eq!(loaded.job_id, checkpoint.job_id);
        assert_eq!(loaded.state, JobState::Uploading);
        assert_eq!(loaded.session.unwrap().bytes_confirmed, 2048);

        assert!(store.load(Path::new("/worlds/beta")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let source = Path::new("/worlds/alpha");

        let mut checkpoint = JobCheckpoint::new(JobId::new(), source);
        store.save(&checkpoint).await.unwrap();
        checkpoint.state = JobState::Archiving;
        store.save(&checkpoint).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, JobState::Archiving);
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_files() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());

        store
            .save(&JobCheckpoint::new(JobId::new(), "/worlds/alpha"))
            .await
            .unwrap();
        store
            .save(&JobCheckpoint::new(JobId::new(), "/worlds/beta"))
            .await
            .unwrap();
        std::fs::write(store.dir().join("garbage.json"), "{").unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path());
        let source = Path::new("/worlds/alpha");

        store.save(&JobCheckpoint::new(JobId::new(), source)).await.unwrap();
        store.remove(source).await.unwrap();
        store.remove(source).await.unwrap();

        assert!(store.load(source).await.unwrap().is_none());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp.path().join("never-created"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_resume_requires_staged_snapshot() {
        let mut checkpoint = JobCheckpoint::new(JobId::new(), "/worlds/alpha");
        assert!(!checkpoint.can_resume_upload());

        checkpoint.snapshot = Some(Snapshot {
            path: PathBuf::from("/nonexistent/world.zip"),
            name: "world.zip".to_string(),
            size_bytes: 10,
            checksum: "abc".to_string(),
            source_version: "20250101-000000".to_string(),
            created_at: Utc::now(),
            file_count: 1,
        });
        assert!(!checkpoint.can_resume_upload());
    }
}
