//! Remote store capability definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use worldback_common::{Credential, Result};

/// Description of the object a new upload session will produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSpec {
    /// Object name on the remote (e.g. `world-20250101-120000.zip`).
    pub name: String,
    /// Logical source the version belongs to.
    pub source: String,
    /// Version tag of the snapshot.
    pub source_version: String,
    /// Content checksum of the archive.
    pub checksum: String,
    /// Total size in bytes.
    pub size_bytes: u64,
}

/// Handle to a resumable upload session allocated by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    /// Session URI or token identifying the upload on the remote.
    pub session_uri: String,
    /// After this instant the remote no longer honours the session.
    pub expires_at: DateTime<Utc>,
}

impl RemoteSession {
    /// Whether the session is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Remote acknowledgement of a chunk or of a session status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// The remote has durably stored this many leading bytes.
    Incomplete { bytes_confirmed: u64 },
    /// The upload is finished and the object has a permanent id.
    Complete { remote_id: String },
}

/// One remote backup version, as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionEntry {
    /// Permanent object identifier.
    pub remote_id: String,
    /// Object name.
    pub name: String,
    /// When the remote object was created.
    pub created_at: DateTime<Utc>,
    /// Version tag of the snapshot it holds.
    pub source_version: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Content checksum, when the store keeps one.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Remote storage capability used by the backup pipeline.
///
/// Every call takes the bearer token explicitly so token refresh stays
/// with the credential store. Implementations map protocol failures onto
/// the shared taxonomy:
/// - `Network` for timeouts, 5xx, 429 and connection resets
/// - `Unauthorized` for rejected access tokens
/// - `SessionExpired` when an upload session is gone
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "googledrive", "local", "memory").
    fn name(&self) -> &str;

    /// Chunk sizes must be a multiple of this many bytes (except the last).
    fn chunk_alignment(&self) -> u64 {
        1
    }

    /// Allocate a resumable upload session for `object`.
    ///
    /// # Postconditions
    /// - Returns a session at offset 0
    async fn create_session(&self, token: &str, object: &ObjectSpec) -> Result<RemoteSession>;

    /// Ask the remote how much of the session it has durably stored.
    async fn query_session(
        &self,
        token: &str,
        session: &RemoteSession,
        total_size: u64,
    ) -> Result<ChunkAck>;

    /// Send `data` starting at `offset`.
    ///
    /// # Preconditions
    /// - `offset` equals the last acknowledged byte count
    ///
    /// # Postconditions
    /// - The returned ack reflects what the remote durably stored, which
    ///   may be less than `offset + data.len()`
    async fn upload_chunk(
        &self,
        token: &str,
        session: &RemoteSession,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<ChunkAck>;

    /// List every stored version for `source`.
    async fn list_versions(&self, token: &str, source: &str) -> Result<Vec<RetentionEntry>>;

    /// Delete one version by its permanent id.
    ///
    /// # Errors
    /// - `NotFound` if the object does not exist
    async fn delete_object(&self, token: &str, remote_id: &str) -> Result<()>;
}

/// Exchange of a refresh token for a new credential.
///
/// Implemented by the OAuth client of each provider that needs one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Mint a new credential from `refresh_token`.
    ///
    /// # Errors
    /// - `RefreshDenied` if the token endpoint rejects the grant
    /// - `Network` on transport failures
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}
