//! Backup configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use worldback_common::{Error, Result};

use crate::retention::RetentionPolicy;
use crate::retry::RetryConfig;

/// Shortest automatic backup interval (one hour).
pub const MIN_BACKUP_INTERVAL_SECS: u64 = 60 * 60;
/// Longest automatic backup interval (one day).
pub const MAX_BACKUP_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// Largest accepted credential refresh margin (one day).
pub const MAX_REFRESH_MARGIN_SECS: u64 = 24 * 60 * 60;

/// What to do with a trigger that arrives while a job is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Drop the trigger.
    #[default]
    Coalesce,
    /// Remember one pending trigger and run it when the active job ends.
    Queue,
}

/// Configuration consumed read-only by the backup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Which remote versions to keep.
    pub retention: RetentionPolicy,
    /// Wildcard patterns (`*`, `?`) for files left out of archives.
    pub exclude_patterns: Vec<String>,
    /// Upload chunk size in bytes.
    pub chunk_size: u64,
    /// Backoff for transient network failures.
    pub retry: RetryConfig,
    /// Job-level attempts before a job is abandoned.
    pub max_attempts: u32,
    /// Longest time the host is asked to pause writes.
    #[serde(rename = "quiescence_timeout_ms", with = "millis")]
    pub quiescence_timeout: Duration,
    /// Re-reads of a file that changed while it was copied.
    pub max_read_retries: u32,
    /// Handling of triggers while a job is active.
    pub trigger_policy: TriggerPolicy,
    /// Staged snapshots, capture directories and job checkpoints.
    pub staging_dir: PathBuf,
    /// Persisted OAuth credential.
    pub credentials_path: PathBuf,
    /// Google client secrets (`credentials.json` from the cloud console).
    pub client_secrets_path: PathBuf,
    /// Refresh the access token this long before it expires.
    pub credential_refresh_margin_secs: u64,
    /// Run backups periodically while the host is up.
    pub auto_backup_enabled: bool,
    /// Period of automatic backups.
    pub backup_interval_secs: u64,
    /// Run one final backup when the host stops.
    pub backup_on_shutdown: bool,
    /// Remote store name, resolved through the store registry.
    pub store: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            retention: RetentionPolicy::default(),
            exclude_patterns: vec![
                "session.lock".to_string(),
                "*.tmp".to_string(),
                "*.lock".to_string(),
            ],
            chunk_size: 8 * 1024 * 1024,
            retry: RetryConfig::default(),
            max_attempts: 3,
            quiescence_timeout: Duration::from_secs(10),
            max_read_retries: 3,
            trigger_policy: TriggerPolicy::Coalesce,
            staging_dir: data_dir.join("staging"),
            credentials_path: data_dir.join("tokens").join("google.json"),
            client_secrets_path: data_dir.join("credentials.json"),
            credential_refresh_margin_secs: 60,
            auto_backup_enabled: true,
            backup_interval_secs: MIN_BACKUP_INTERVAL_SECS,
            backup_on_shutdown: true,
            store: "googledrive".to_string(),
        }
    }
}

/// Base directory for Worldback state (`<data dir>/worldback`).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worldback")
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("worldback")
        .join("config.json")
}

impl BackupConfig {
    /// Load configuration from `path`; a missing file yields the defaults.
    ///
    /// # Errors
    /// - `Serialization` if the file is not valid configuration JSON
    /// - `InvalidInput` if validation fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<Self>(&content).map_err(|e| {
                Error::Serialization(format!("Invalid config {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(Error::Io(e)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path` with an atomic replace.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(path.as_ref(), &json)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// - `InvalidInput` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        self.retention.validate()?;
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput("chunk_size must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be at least 1".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::InvalidInput(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.credential_refresh_margin_secs > MAX_REFRESH_MARGIN_SECS {
            return Err(Error::InvalidInput(format!(
                "credential_refresh_margin_secs must be at most {}",
                MAX_REFRESH_MARGIN_SECS
            )));
        }
        if self.store.trim().is_empty() {
            return Err(Error::InvalidInput("store must not be empty".to_string()));
        }
        Ok(())
    }

    /// Automatic backup period, clamped to one hour ..= one day.
    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(
            self.backup_interval_secs
                .clamp(MIN_BACKUP_INTERVAL_SECS, MAX_BACKUP_INTERVAL_SECS),
        )
    }

    /// Credential refresh safety margin, capped at one day.
    pub fn refresh_margin(&self) -> chrono::Duration {
        let secs = self.credential_refresh_margin_secs.min(MAX_REFRESH_MARGIN_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

/// Write `data` to a sibling temp file, fsync it and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde helper: `Option<Duration>` as integer seconds, `null` for none.
pub(crate) mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
