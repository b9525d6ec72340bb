//! Local filesystem remote store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::provider::{ChunkAck, ObjectSpec, RemoteSession, RemoteStore, RetentionEntry};
use worldback_common::{Error, Result};

const SESSIONS_DIRNAME: &str = "sessions";
const OBJECTS_DIRNAME: &str = "objects";

/// Session bookkeeping persisted next to the partial upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    object: ObjectSpec,
    expires_at: DateTime<Utc>,
    #[serde(default)]
    completed: Option<String>,
}

/// Local filesystem remote store.
///
/// Treats a directory (for example a mounted network share) as the
/// remote. Partial uploads live under `sessions/`, finished versions
/// under `objects/<source>/` with a JSON sidecar per version. Tokens are
/// not checked.
pub struct LocalStore {
    root: PathBuf,
    session_ttl: Duration,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root, session and object directories exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        std::fs::create_dir_all(root.join(SESSIONS_DIRNAME))?;
        std::fs::create_dir_all(root.join(OBJECTS_DIRNAME))?;

        Ok(Self {
            root,
            session_ttl: Duration::days(7),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_id(session: &RemoteSession) -> Result<&str> {
        let id = session
            .session_uri
            .strip_prefix("local://upload/")
            .ok_or_else(|| {
                Error::InvalidInput(format!("Not a local session: {}", session.session_uri))
            })?;
        if id.is_empty() || id.contains(['/', '\\', '.']) {
            return Err(Error::InvalidInput(format!("Bad session id: {}", id)));
        }
        Ok(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(SESSIONS_DIRNAME).join(format!("{}.json", id))
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.root.join(SESSIONS_DIRNAME).join(format!("{}.part", id))
    }

    fn source_dir(&self, source: &str) -> PathBuf {
        self.root.join(OBJECTS_DIRNAME).join(sanitize_component(source))
    }

    async fn load_record(&self, session: &RemoteSession) -> Result<(String, SessionRecord)> {
        let id = Self::session_id(session)?.to_string();
        let path = self.record_path(&id);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SessionExpired(format!("Unknown session: {}", id)));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let record: SessionRecord =
            serde_json::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))?;

        if record.completed.is_none() && record.expires_at <= Utc::now() {
            self.discard_session(&id).await;
            return Err(Error::SessionExpired(format!("Session expired: {}", id)));
        }

        Ok((id, record))
    }

    async fn discard_session(&self, id: &str) {
        let _ = fs::remove_file(self.part_path(id)).await;
        let _ = fs::remove_file(self.record_path(id)).await;
    }

    async fn confirmed_len(&self, id: &str) -> Result<u64> {
        match fs::metadata(self.part_path(id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn finalize(&self, id: &str, mut record: SessionRecord) -> Result<String> {
        let remote_id = Uuid::new_v4().simple().to_string();
        let dir = self.source_dir(&record.object.source);
        fs::create_dir_all(&dir).await?;

        fs::rename(self.part_path(id), dir.join(format!("{}.zip", remote_id))).await?;

        let entry = RetentionEntry {
            remote_id: remote_id.clone(),
            name: record.object.name.clone(),
            created_at: Utc::now(),
            source_version: record.object.source_version.clone(),
            size_bytes: record.object.size_bytes,
            checksum: Some(record.object.checksum.clone()),
        };
        write_json_atomic(&dir.join(format!("{}.json", remote_id)), &entry).await?;

        record.completed = Some(remote_id.clone());
        write_json_atomic(&self.record_path(id), &record).await?;

        Ok(remote_id)
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_session(&self, _token: &str, object: &ObjectSpec) -> Result<RemoteSession> {
        let id = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now() + self.session_ttl;

        fs::File::create(self.part_path(&id)).await?;
        write_json_atomic(
            &self.record_path(&id),
            &SessionRecord {
                object: object.clone(),
                expires_at,
                completed: None,
            },
        )
        .await?;

        Ok(RemoteSession {
            session_uri: format!("local://upload/{}", id),
            expires_at,
        })
    }

    async fn query_session(
        &self,
        _token: &str,
        session: &RemoteSession,
        _total_size: u64,
    ) -> Result<ChunkAck> {
        let (id, record) = self.load_record(session).await?;
        if let Some(remote_id) = record.completed {
            return Ok(ChunkAck::Complete { remote_id });
        }
        Ok(ChunkAck::Incomplete {
            bytes_confirmed: self.confirmed_len(&id).await?,
        })
    }

    async fn upload_chunk(
        &self,
        _token: &str,
        session: &RemoteSession,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<ChunkAck> {
        let (id, record) = self.load_record(session).await?;
        if let Some(remote_id) = record.completed {
            return Ok(ChunkAck::Complete { remote_id });
        }

        let confirmed = self.confirmed_len(&id).await?;
        if offset != confirmed || confirmed + data.len() as u64 > total_size {
            return Ok(ChunkAck::Incomplete {
                bytes_confirmed: confirmed,
            });
        }

        let mut part = fs::OpenOptions::new()
            .append(true)
            .open(self.part_path(&id))
            .await?;
        part.write_all(data).await?;
        part.sync_data().await?;
        drop(part);

        let confirmed = confirmed + data.len() as u64;
        if confirmed == total_size {
            let remote_id = self.finalize(&id, record).await?;
            return Ok(ChunkAck::Complete { remote_id });
        }

        Ok(ChunkAck::Incomplete {
            bytes_confirmed: confirmed,
        })
    }

    async fn list_versions(&self, _token: &str, source: &str) -> Result<Vec<RetentionEntry>> {
        let dir = self.source_dir(source);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let content = fs::read_to_string(&path).await?;
                match serde_json::from_str::<RetentionEntry>(&content) {
                    Ok(version) => versions.push(version),
                    Err(e) => tracing::warn!("Skipping unreadable sidecar {:?}: {}", path, e),
                }
            }
        }

        versions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(versions)
    }

    async fn delete_object(&self, _token: &str, remote_id: &str) -> Result<()> {
        if remote_id.is_empty() || remote_id.contains(['/', '\\', '.']) {
            return Err(Error::InvalidInput(format!("Bad object id: {}", remote_id)));
        }

        let mut sources = fs::read_dir(self.root.join(OBJECTS_DIRNAME)).await?;
        while let Some(source) = sources.next_entry().await? {
            let sidecar = source.path().join(format!("{}.json", remote_id));
            if fs::try_exists(&sidecar).await? {
                let data = source.path().join(format!("{}.zip", remote_id));
                if fs::try_exists(&data).await? {
                    fs::remove_file(&data).await?;
                }
                fs::remove_file(&sidecar).await?;
                return Ok(());
            }
        }

        Err(Error::NotFound(format!("Object not found: {}", remote_id)))
    }
}

/// Map an arbitrary source name onto a single safe path component.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Write JSON to a temp file and rename it into place.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(value).map_err(|e| Error::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn object_spec(size: u64) -> ObjectSpec {
        ObjectSpec {
            name: "My World-20250101-000000.zip".to_string(),
            source: "My World".to_string(),
            source_version: "20250101-000000".to_string(),
            checksum: "abc".to_string(),
            size_bytes: size,
        }
    }

    #[tokio::test]
    async fn test_upload_and_list() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let session = store.create_session("", &object_spec(4)).await.unwrap();
        let ack = store.upload_chunk("", &session, 0, b"ab", 4).await.unwrap();
        assert_eq!(ack, ChunkAck::Incomplete { bytes_confirmed: 2 });

        let ack = store.upload_chunk("", &session, 2, b"cd", 4).await.unwrap();
        assert!(matches!(ack, ChunkAck::Complete { .. }));

        let versions = store.list_versions("", "My World").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].size_bytes, 4);
    }

    #[tokio::test]
    async fn test_resume_after_reopen() {
        let temp = TempDir::new().unwrap();
        let session = {
            let store = LocalStore::new(temp.path()).unwrap();
            let session = store.create_session("", &object_spec(4)).await.unwrap();
            store.upload_chunk("", &session, 0, b"ab", 4).await.unwrap();
            session
        };

        let store = LocalStore::new(temp.path()).unwrap();
        let ack = store.query_session("", &session, 4).await.unwrap();
        assert_eq!(ack, ChunkAck::Incomplete { bytes_confirmed: 2 });
    }

    #[tokio::test]
    async fn test_completed_session_reports_id() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let session = store.create_session("", &object_spec(2)).await.unwrap();
        let ChunkAck::Complete { remote_id } =
            store.upload_chunk("", &session, 0, b"ab", 2).await.unwrap()
        else {
            panic!("expected completion");
        };

        let ack = store.query_session("", &session, 2).await.unwrap();
        assert_eq!(ack, ChunkAck::Complete { remote_id });
    }

    #[tokio::test]
    async fn test_delete_object() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();

        let session = store.create_session("", &object_spec(2)).await.unwrap();
        let ChunkAck::Complete { remote_id } =
            store.upload_chunk("", &session, 0, b"ab", 2).await.unwrap()
        else {
            panic!("expected completion");
        };

        store.delete_object("", &remote_id).await.unwrap();
        assert!(store.list_versions("", "My World").await.unwrap().is_empty());
        assert!(matches!(
            store.delete_object("", &remote_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_expired() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path()).unwrap();
        let session = RemoteSession {
            session_uri: "local://upload/deadbeef".to_string(),
            expires_at: Utc::now() + Duration::days(1),
        };

        let result = store.query_session("", &session, 4).await;
        assert!(matches!(result, Err(Error::SessionExpired(_))));
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("My World"), "My_World");
        assert_eq!(sanitize_component("../etc"), "___etc");
        assert_eq!(sanitize_component(""), "_");
    }
}
