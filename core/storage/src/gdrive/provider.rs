//! Google Drive remote store implementation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

use worldback_common::{Error, Result};

use crate::provider::{ChunkAck, ObjectSpec, RemoteSession, RemoteStore, RetentionEntry};

use super::client::{DriveClient, DriveFile, UploadStatus};

/// Drive requires chunk sizes in multiples of 256 KiB.
pub const DRIVE_CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// Drive keeps resumable sessions for about a week.
const SESSION_LIFETIME_DAYS: i64 = 7;

pub(crate) const PROP_SOURCE: &str = "worldback_source";
pub(crate) const PROP_VERSION: &str = "worldback_version";
pub(crate) const PROP_CHECKSUM: &str = "worldback_checksum";

/// Google Drive store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveConfig {
    /// Folder in the user's Drive that holds all backups.
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
}

fn default_folder_name() -> String {
    "Worldback Machine".to_string()
}

impl Default for GDriveConfig {
    fn default() -> Self {
        Self {
            folder_name: default_folder_name(),
        }
    }
}

/// Google Drive remote store.
///
/// Versions live as files in one backup folder, tagged with private app
/// properties naming their source, version and checksum.
pub struct GDriveStore {
    config: GDriveConfig,
    client: DriveClient,
    folder_id: OnceCell<String>,
}

impl GDriveStore {
    /// Create a new Google Drive store.
    ///
    /// # Errors
    /// - HTTP client construction failure
    pub fn new(config: GDriveConfig) -> Result<Self> {
        Ok(Self {
            config,
            client: DriveClient::new()?,
            folder_id: OnceCell::new(),
        })
    }

    /// Resolve the backup folder, creating it on first use.
    async fn folder_id(&self, token: &str) -> Result<&str> {
        let id = self
            .folder_id
            .get_or_try_init(|| async {
                if let Some(folder) = self.client.find_folder(token, &self.config.folder_name).await? {
                    return Ok::<_, Error>(folder.id);
                }
                tracing::info!("Creating Drive folder '{}'", self.config.folder_name);
                Ok(self.client.create_folder(token, &self.config.folder_name).await?.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

fn to_ack(status: UploadStatus) -> ChunkAck {
    match status {
        UploadStatus::Incomplete { bytes_confirmed } => ChunkAck::Incomplete { bytes_confirmed },
        UploadStatus::Complete(file) => ChunkAck::Complete { remote_id: file.id },
    }
}

/// Convert a listed Drive file into a retention entry.
///
/// Files without a creation time cannot be ordered and are skipped.
fn to_retention_entry(file: DriveFile) -> Option<RetentionEntry> {
    let created_at = file.created_time?;
    let size_bytes = file.size_bytes().unwrap_or(0);
    let source_version = file
        .app_properties
        .get(PROP_VERSION)
        .cloned()
        .unwrap_or_else(|| file.name.clone());
    let checksum = file.app_properties.get(PROP_CHECKSUM).cloned();

    Some(RetentionEntry {
        remote_id: file.id,
        name: file.name,
        created_at,
        source_version,
        size_bytes,
        checksum,
    })
}

#[async_trait]
impl RemoteStore for GDriveStore {
    fn name(&self) -> &str {
        "googledrive"
    }

    fn chunk_alignment(&self) -> u64 {
        DRIVE_CHUNK_ALIGNMENT
    }

    async fn create_session(&self, token: &str, object: &ObjectSpec) -> Result<RemoteSession> {
        let folder_id = self.folder_id(token).await?;
        let metadata = serde_json::json!({
            "name": object.name,
            "parents": [folder_id],
            "mimeType": "application/zip",
            "appProperties": {
                PROP_SOURCE: object.source,
                PROP_VERSION: object.source_version,
                PROP_CHECKSUM: object.checksum,
            },
        });

        let session_uri = self
            .client
            .start_resumable_upload(token, &metadata, object.size_bytes)
            .await?;
        tracing::debug!("Started Drive upload session for {}", object.name);

        Ok(RemoteSession {
            session_uri,
            expires_at: Utc::now() + Duration::days(SESSION_LIFETIME_DAYS),
        })
    }

    async fn query_session(
        &self,
        token: &str,
        session: &RemoteSession,
        total_size: u64,
    ) -> Result<ChunkAck> {
        let status = self
            .client
            .query_upload_status(token, &session.session_uri, total_size)
            .await?;
        Ok(to_ack(status))
    }

    async fn upload_chunk(
        &self,
        token: &str,
        session: &RemoteSession,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<ChunkAck> {
        let status = self
            .client
            .upload_chunk(token, &session.session_uri, offset, data, total_size)
            .await?;
        Ok(to_ack(status))
    }

    async fn list_versions(&self, token: &str, source: &str) -> Result<Vec<RetentionEntry>> {
        let folder_id = self.folder_id(token).await?;
        let files = self
            .client
            .list_by_app_property(token, folder_id, PROP_SOURCE, source)
            .await?;

        let mut entries: Vec<RetentionEntry> = files
            .into_iter()
            .filter(|f| !f.is_folder())
            .filter_map(to_retention_entry)
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn delete_object(&self, token: &str, remote_id: &str) -> Result<()> {
        self.client.delete(token, remote_id).await
    }
}

/// Create a Google Drive store from JSON configuration.
///
/// `null` selects the defaults.
pub fn create_gdrive_store(config: serde_json::Value) -> Result<Arc<dyn RemoteStore>> {
    let gdrive_config: GDriveConfig = if config.is_null() {
        GDriveConfig::default()
    } else {
        serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid Google Drive config: {}", e)))?
    };

    Ok(Arc::new(GDriveStore::new(gdrive_config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn drive_file(props: &[(&str, &str)]) -> DriveFile {
        DriveFile {
            id: "file_id".to_string(),
            name: "world-20250101-000000.zip".to_string(),
            mime_type: "application/zip".to_string(),
            size: Some("2048".to_string()),
            created_time: Some(Utc::now()),
            app_properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_to_retention_entry() {
        let file = drive_file(&[
            (PROP_SOURCE, "world"),
            (PROP_VERSION, "20250101-000000"),
            (PROP_CHECKSUM, "abcd"),
        ]);

        let entry = to_retention_entry(file).unwrap();
        assert_eq!(entry.remote_id, "file_id");
        assert_eq!(entry.size_bytes, 2048);
        assert_eq!(entry.source_version, "20250101-000000");
        assert_eq!(entry.checksum.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_to_retention_entry_requires_created_time() {
        let mut file = drive_file(&[]);
        file.created_time = None;
        assert!(to_retention_entry(file).is_none());
    }

    #[test]
    fn test_to_retention_entry_falls_back_to_name() {
        let entry = to_retention_entry(drive_file(&[])).unwrap();
        assert_eq!(entry.source_version, "world-20250101-000000.zip");
        assert_eq!(entry.checksum, None);
    }

    #[test]
    fn test_to_ack() {
        assert_eq!(
            to_ack(UploadStatus::Incomplete { bytes_confirmed: 10 }),
            ChunkAck::Incomplete { bytes_confirmed: 10 }
        );
        assert_eq!(
            to_ack(UploadStatus::Complete(drive_file(&[]))),
            ChunkAck::Complete {
                remote_id: "file_id".to_string()
            }
        );
    }

    #[test]
    fn test_create_gdrive_store_factory() {
        let store = create_gdrive_store(serde_json::Value::Null).unwrap();
        assert_eq!(store.name(), "googledrive");
        assert_eq!(store.chunk_alignment(), DRIVE_CHUNK_ALIGNMENT);

        let store = create_gdrive_store(serde_json::json!({ "folder_name": "Backups" })).unwrap();
        assert_eq!(store.name(), "googledrive");
    }

    #[test]
    fn test_create_gdrive_store_invalid_config() {
        let result = create_gdrive_store(serde_json::json!({ "folder_name": 5 }));
        assert!(result.is_err());
    }
}
