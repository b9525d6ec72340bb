//! Common types used throughout Worldback.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroize;

/// Unique identifier for a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job identifier from its string form.
    ///
    /// # Errors
    /// - Returns error if `id` is not a valid UUID
    pub fn parse(id: &str) -> crate::Result<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid job id '{}': {}", id, e)))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secret string that zeroizes on drop and never prints its contents.
#[derive(Clone, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a secret value.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret for the duration of a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretString([REDACTED; {} chars])", self.0.len())
    }
}

/// OAuth access token plus the material needed to refresh it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Short-lived bearer token for remote requests.
    pub access_token: SecretString,
    /// Long-lived token used to mint new access tokens.
    pub refresh_token: SecretString,
    /// When the access token stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: SecretString::new(access_token),
            refresh_token: SecretString::new(refresh_token),
            expires_at,
        }
    }

    /// Whether the access token expires within `margin` of `now`.
    ///
    /// A margin reaching past the representable range counts as expiring.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now.checked_add_signed(margin)
            .map_or(true, |deadline| self.expires_at <= deadline)
    }

    /// Bearer token value for request headers.
    pub fn bearer(&self) -> &str {
        self.access_token.expose()
    }
}
