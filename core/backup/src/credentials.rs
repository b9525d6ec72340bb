//! Credential store with single-flight refresh and durable persistence.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use worldback_common::{Credential, Error, Result};
use worldback_storage::TokenRefresher;

/// Default safety margin before expiry at which a token is refreshed.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Owner of the OAuth credential used for remote requests.
///
/// Reads are served from an in-memory cache. Refreshes are serialized by
/// a gate: callers that queued behind an in-flight refresh re-check the
/// cache and reuse its result instead of issuing their own.
pub struct CredentialStore {
    path: Option<PathBuf>,
    refresher: Arc<dyn TokenRefresher>,
    margin: Duration,
    cache: RwLock<Option<Credential>>,
    refresh_gate: Mutex<()>,
}

impl CredentialStore {
    /// Create a store persisted at `path`.
    ///
    /// Nothing is read until the first token request or [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            path: Some(path.into()),
            refresher,
            margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            cache: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Create a store that only lives in memory.
    pub fn in_memory(credential: Credential, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            path: None,
            refresher,
            margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            cache: RwLock::new(Some(credential)),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Store for remotes that need no authorization (local, in-memory).
    pub fn anonymous() -> Self {
        let credential = Credential::new("anonymous", "anonymous", DateTime::<Utc>::MAX_UTC);
        Self::in_memory(credential, Arc::new(NoRefresh))
    }

    /// Set the refresh safety margin.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Path of the persisted credential, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the persisted credential into the cache.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if nothing has been persisted
    /// - `Serialization` if the file is corrupt
    pub async fn load(&self) -> Result<Credential> {
        let credential = self.read_file().await?;
        *self.cache.write().await = Some(credential.clone());
        Ok(credential)
    }

    /// Get a credential that stays valid for at least the safety margin.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if no credential exists
    /// - `RefreshDenied` if the refresh token was revoked
    /// - `Network` on transient refresh failures
    pub async fn get_valid_token(&self) -> Result<Credential> {
        if let Some(credential) = self.cached_if_fresh().await {
            return Ok(credential);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(credential) = self.cached_if_fresh().await {
            return Ok(credential);
        }

        let current = match self.cache.read().await.clone() {
            Some(credential) => credential,
            None => self.read_file().await?,
        };

        if !current.expires_within(self.margin, Utc::now()) {
            *self.cache.write().await = Some(current.clone());
            return Ok(current);
        }

        self.refresh_locked(&current).await
    }

    /// Force a refresh exchange.
    pub async fn refresh(&self) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;
        let current = match self.cache.read().await.clone() {
            Some(credential) => credential,
            None => self.read_file().await?,
        };
        self.refresh_locked(&current).await
    }

    /// Refresh unless the cached token already differs from `rejected`.
    ///
    /// Used after a remote rejected `rejected`: if a concurrent caller has
    /// already replaced it, the replacement is returned without a new
    /// exchange.
    pub async fn refresh_if_stale(&self, rejected: &str) -> Result<Credential> {
        let _gate = self.refresh_gate.lock().await;
        let current = match self.cache.read().await.clone() {
            Some(credential) => credential,
            None => self.read_file().await?,
        };

        if current.bearer() != rejected && !current.expires_within(self.margin, Utc::now()) {
            debug!("Access token already replaced by a concurrent refresh");
            return Ok(current);
        }

        self.refresh_locked(&current).await
    }

    /// Mark the cached access token as unusable; the next request refreshes.
    pub async fn invalidate(&self) {
        if let Some(credential) = self.cache.write().await.as_mut() {
            credential.expires_at = DateTime::<Utc>::MIN_UTC;
        }
    }

    /// Adopt a credential from an interactive authorization and persist it.
    pub async fn store(&self, credential: Credential) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        self.persist(&credential).await?;
        *self.cache.write().await = Some(credential);
        Ok(())
    }

    /// Forget the credential in memory and on disk.
    pub async fn sign_out(&self) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        *self.cache.write().await = None;

        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("Removed stored credential {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Write `credential` with write-temp-then-rename.
    ///
    /// The file is created with mode 0600 on Unix.
    pub async fn persist(&self, credential: &Credential) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(credential)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Run `op` with a valid access token.
    ///
    /// An `Unauthorized` result triggers one refresh-and-retry cycle; a
    /// second rejection surfaces as `AuthenticationRequired`.
    pub async fn with_token<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = self.get_valid_token().await?;
        match op(credential.bearer().to_string()).await {
            Err(Error::Unauthorized(msg)) => {
                debug!("Access token rejected ({}), refreshing", msg);
                let fresh = self.refresh_if_stale(credential.bearer()).await?;
                op(fresh.bearer().to_string()).await.map_err(|e| match e {
                    Error::Unauthorized(msg) => Error::AuthenticationRequired(msg),
                    other => other,
                })
            }
            other => other,
        }
    }

    async fn cached_if_fresh(&self) -> Option<Credential> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|c| !c.expires_within(self.margin, Utc::now()))
            .cloned()
    }

    async fn read_file(&self) -> Result<Credential> {
        let Some(path) = &self.path else {
            return Err(Error::AuthenticationRequired(
                "No credential available".to_string(),
            ));
        };

        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::AuthenticationRequired(format!(
                    "No stored credential at {}",
                    path.display()
                )));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        serde_json::from_str(&content).map_err(|e| {
            Error::Serialization(format!("Corrupt credential file {}: {}", path.display(), e))
        })
    }

    /// Exchange the refresh token. Caller holds the refresh gate.
    async fn refresh_locked(&self, current: &Credential) -> Result<Credential> {
        info!("Refreshing access token");

        match self.refresher.refresh(current.refresh_token.expose()).await {
            Ok(fresh) => {
                if let Err(e) = self.persist(&fresh).await {
                    warn!("Failed to persist refreshed credential: {}", e);
                }
                *self.cache.write().await = Some(fresh.clone());
                Ok(fresh)
            }
            Err(err @ Error::RefreshDenied(_)) => {
                warn!("Refresh token rejected; re-authorization required");
                *self.cache.write().await = None;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

/// Refresher for credentials that never expire.
struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        Err(Error::RefreshDenied(
            "Credential cannot be refreshed".to_string(),
        ))
    }
}
