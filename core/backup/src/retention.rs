//! Retention policy and pruning of old remote versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use worldback_common::{Error, Result};
use worldback_storage::{RemoteStore, RetentionEntry};

use crate::credentials::CredentialStore;
use crate::retry::RetryExecutor;

/// Which remote versions survive a prune.
///
/// A version is deleted only when it is outside the `keep_last` most
/// recent and older than `keep_within`. The `min_keep` most recent are
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many of the most recent versions.
    pub keep_last: Option<usize>,
    /// Keep every version younger than this.
    #[serde(rename = "keep_within_secs", with = "crate::config::opt_secs")]
    pub keep_within: Option<Duration>,
    /// Floor of most recent versions kept regardless of age.
    pub min_keep: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: Some(5),
            keep_within: Some(Duration::from_secs(7 * 24 * 60 * 60)),
            min_keep: 2,
        }
    }
}

impl RetentionPolicy {
    /// Keep the `n` most recent versions, with a floor of `min_keep`.
    pub fn keep_last(n: usize, min_keep: usize) -> Self {
        Self {
            keep_last: Some(n),
            keep_within: None,
            min_keep,
        }
    }

    /// Also keep everything younger than `age`.
    pub fn with_keep_within(mut self, age: Option<Duration>) -> Self {
        self.keep_within = age;
        self
    }

    /// Check `min_keep <= keep_last`.
    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.keep_last {
            if self.min_keep > n {
                return Err(Error::InvalidInput(format!(
                    "retention.min_keep ({}) must not exceed retention.keep_last ({})",
                    self.min_keep, n
                )));
            }
        }
        Ok(())
    }
}

/// Entries `policy` would delete, oldest first.
///
/// `protected` names the version being completed right now. It is never
/// returned, and if the listing does not show it yet it still counts as
/// the newest version.
pub fn plan_retention(
    entries: &[RetentionEntry],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    protected: Option<&str>,
) -> Vec<RetentionEntry> {
    if policy.keep_last.is_none() && policy.keep_within.is_none() {
        return Vec::new();
    }

    let mut sorted: Vec<&RetentionEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.remote_id.cmp(&a.remote_id))
    });

    let invisible_protected = match protected {
        Some(id) => !entries.iter().any(|e| e.remote_id == id),
        None => false,
    };
    let offset = usize::from(invisible_protected);

    let cutoff = policy
        .keep_within
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .and_then(|age| now.checked_sub_signed(age));

    let mut doomed: Vec<RetentionEntry> = sorted
        .into_iter()
        .enumerate()
        .filter(|(index, entry)| {
            let rank = index + offset;
            if rank < policy.min_keep || Some(entry.remote_id.as_str()) == protected {
                return false;
            }
            let recent = policy.keep_last.is_some_and(|n| rank < n);
            let young = match (policy.keep_within, cutoff) {
                (Some(_), Some(cutoff)) => entry.created_at > cutoff,
                (Some(_), None) => true,
                (None, _) => false,
            };
            !recent && !young
        })
        .map(|(_, entry)| entry.clone())
        .collect();

    doomed.reverse();
    doomed
}

/// Outcome of one prune.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Ids actually deleted.
    pub deleted: Vec<String>,
    /// Ids that could not be deleted, with the reason.
    pub failures: Vec<(String, String)>,
    /// Versions left after the prune.
    pub kept: usize,
    /// Whether cancellation stopped the prune early.
    pub cancelled: bool,
}

/// Applies a [`RetentionPolicy`] to one remote.
pub struct RetentionManager {
    store: Arc<dyn RemoteStore>,
    credentials: Arc<CredentialStore>,
    retry: Arc<RetryExecutor>,
}

impl RetentionManager {
    /// Create a retention manager.
    pub fn new(
        store: Arc<dyn RemoteStore>,
        credentials: Arc<CredentialStore>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            store,
            credentials,
            retry,
        }
    }

    /// List the versions of `source`, newest last.
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires while waiting to retry
    pub async fn list(&self, source: &str, cancel: &CancellationToken) -> Result<Vec<RetentionEntry>> {
        let store = self.store.clone();
        let mut entries = self
            .retry
            .execute(cancel, || {
                let store = store.clone();
                self.credentials.with_token(move |token| {
                    let store = store.clone();
                    let source = source.to_string();
                    async move { store.list_versions(&token, &source).await }
                })
            })
            .await?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Delete the versions of `source` that `policy` no longer keeps.
    ///
    /// Deletions run one at a time; a failed deletion is recorded and the
    /// rest continue. Cancellation lets an in-flight deletion finish and
    /// starts no new one or retry.
    ///
    /// # Errors
    /// - `PruneFailure` if the versions cannot be listed
    /// - `Cancelled` if `cancel` fires while listing is backing off
    /// - `InvalidInput` if the policy is inconsistent
    pub async fn prune(
        &self,
        source: &str,
        policy: &RetentionPolicy,
        protected: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PruneReport> {
        policy.validate()?;

        let entries = self.list(source, cancel).await.map_err(|e| {
            if e.is_cancelled() {
                e
            } else {
                Error::PruneFailure(format!("Cannot list versions of {}: {}", source, e))
            }
        })?;

        let doomed = plan_retention(&entries, policy, Utc::now(), protected);
        debug!(
            "{} of {} versions of {} are past retention",
            doomed.len(),
            entries.len(),
            source
        );

        let mut report = PruneReport::default();
        for entry in &doomed {
            if cancel.is_cancelled() {
                info!("Prune of {} cancelled before deleting {}", source, entry.remote_id);
                report.cancelled = true;
                break;
            }

            match self.delete(&entry.remote_id, cancel).await {
                Err(Error::Cancelled) => {
                    info!("Prune of {} cancelled while retrying {}", source, entry.remote_id);
                    report.cancelled = true;
                    break;
                }
                Ok(()) | Err(Error::NotFound(_)) => {
                    info!("Pruned {} ({})", entry.name, entry.remote_id);
                    report.deleted.push(entry.remote_id.clone());
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", entry.remote_id, e);
                    report.failures.push((entry.remote_id.clone(), e.to_string()));
                }
            }
        }

        let deleted: HashSet<&str> = report.deleted.iter().map(String::as_str).collect();
        report.kept = entries
            .iter()
            .filter(|e| !deleted.contains(e.remote_id.as_str()))
            .count();
        Ok(report)
    }

    async fn delete(&self, remote_id: &str, cancel: &CancellationToken) -> Result<()> {
        let store = self.store.clone();
        self.retry
            .execute(cancel, || {
                let store = store.clone();
                self.credentials.with_token(move |token| {
                    let store = store.clone();
                    let remote_id = remote_id.to_string();
                    async move { store.delete_object(&token, &remote_id).await }
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use worldback_storage::MemoryStore;

    fn entry(id: &str, created_at: DateTime<Utc>) -> RetentionEntry {
        RetentionEntry {
            remote_id: id.to_string(),
            name: format!("{}.zip", id),
            created_at,
            source_version: created_at.format("%Y%m%d-%H%M%S").to_string(),
            size_bytes: 16,
            checksum: None,
        }
    }

    /// `count` entries, one day apart, `v0` oldest.
    fn history(now: DateTime<Utc>, count: usize) -> Vec<RetentionEntry> {
        (0..count)
            .map(|i| {
                entry(
                    &format!("v{}", i),
                    now - ChronoDuration::days((count - i) as i64),
                )
            })
            .collect()
    }

    fn ids(entries: &[RetentionEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.remote_id.as_str()).collect()
    }

    fn manager(store: &MemoryStore) -> RetentionManager {
        RetentionManager::new(
            Arc::new(store.clone()),
            Arc::new(CredentialStore::anonymous()),
            Arc::new(RetryExecutor::new(
                RetryConfig::new(2)
                    .with_initial_delay(std::time::Duration::from_millis(1))
                    .with_jitter(false),
            )),
        )
    }

    #[test]
    fn test_six_versions_keep_last_five_deletes_oldest() {
        let now = Utc::now();
        let entries = history(now, 6);
        let policy = RetentionPolicy::keep_last(5, 2);

        let doomed = plan_retention(&entries, &policy, now, None);
        assert_eq!(ids(&doomed), vec!["v0"]);
    }

    #[test]
    fn test_keep_within_protects_young_versions() {
        let now = Utc::now();
        let entries = history(now, 10);
        let policy = RetentionPolicy::keep_last(2, 1)
            .with_keep_within(Some(std::time::Duration::from_secs(4 * 86_400 + 60)));

        // v6..v9 are younger than four days, v8 and v9 are also the last two
        let doomed = plan_retention(&entries, &policy, now, None);
        assert_eq!(ids(&doomed), vec!["v0", "v1", "v2", "v3", "v4", "v5"]);
    }

    #[test]
    fn test_no_rules_keeps_everything() {
        let now = Utc::now();
        let policy = RetentionPolicy {
            keep_last: None,
            keep_within: None,
            min_keep: 0,
        };
        assert!(plan_retention(&history(now, 8), &policy, now, None).is_empty());
    }

    #[test]
    fn test_min_keep_floor_overrides_age() {
        let now = Utc::now();
        let policy = RetentionPolicy {
            keep_last: None,
            keep_within: Some(std::time::Duration::from_secs(60)),
            min_keep: 2,
        };

        let doomed = plan_retention(&history(now, 4), &policy, now, None);
        assert_eq!(ids(&doomed), vec!["v0", "v1"]);
    }

    #[test]
    fn test_protected_entry_is_never_deleted() {
        let now = Utc::now();
        let mut entries = history(now, 3);
        // The version being completed shows up with a skewed, old timestamp.
        entries.push(entry("fresh", now - ChronoDuration::days(30)));
        let policy = RetentionPolicy::keep_last(1, 1);

        let doomed = plan_retention(&entries, &policy, now, Some("fresh"));
        assert_eq!(ids(&doomed), vec!["v0", "v1"]);
    }

    #[test]
    fn test_invisible_protected_entry_counts_as_newest() {
        let now = Utc::now();
        let entries = history(now, 5);
        let policy = RetentionPolicy::keep_last(5, 2);

        let doomed = plan_retention(&entries, &policy, now, Some("not-listed-yet"));
        assert_eq!(ids(&doomed), vec!["v0"]);
    }

    #[test]
    fn test_validate() {
        assert!(RetentionPolicy::keep_last(5, 2).validate().is_ok());
        assert!(RetentionPolicy::keep_last(1, 2).validate().is_err());
        assert!(RetentionPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_policy_serialization() {
        let json = serde_json::to_value(RetentionPolicy::default()).unwrap();
        assert_eq!(json["keep_last"], 5);
        assert_eq!(json["keep_within_secs"], 604_800);
        assert_eq!(json["min_keep"], 2);

        let policy: RetentionPolicy =
            serde_json::from_str(r#"{"keep_last": 3, "keep_within_secs": null}"#).unwrap();
        assert_eq!(policy.keep_last, Some(3));
        assert_eq!(policy.keep_within, None);
        assert_eq!(policy.min_keep, 2);
    }

    proptest! {
        #[test]
        fn prop_prune_respects_policy(
            ages in prop::collection::vec(0u32..2_000, 0..30),
            n in 1usize..8,
            m_offset in 0usize..8,
            d_hours in prop::option::of(1u32..1_500),
        ) {
            let now = Utc::now();
            let m = m_offset.min(n);
            let entries: Vec<RetentionEntry> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| entry(&format!("e{:02}", i), now - ChronoDuration::hours(*age as i64)))
                .collect();
            let policy = RetentionPolicy {
                keep_last: Some(n),
                keep_within: d_hours.map(|h| std::time::Duration::from_secs(h as u64 * 3600)),
                min_keep: m,
            };

            let doomed = plan_retention(&entries, &policy, now, None);
            let doomed_ids: HashSet<&str> = doomed.iter().map(|e| e.remote_id.as_str()).collect();

            let mut newest: Vec<&RetentionEntry> = entries.iter().collect();
            newest.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.remote_id.cmp(&a.remote_id)));

            let kept: Vec<&RetentionEntry> = newest
                .iter()
                .copied()
                .filter(|e| !doomed_ids.contains(e.remote_id.as_str()))
                .collect();

            // Floor of M versions.
            prop_assert!(kept.len() >= m.min(entries.len()));

            // The N most recent always survive.
            for e in newest.iter().take(n) {
                prop_assert!(!doomed_ids.contains(e.remote_id.as_str()));
            }

            // Everything younger than D survives.
            if let Some(h) = d_hours {
                let cutoff = now - ChronoDuration::hours(h as i64);
                for e in &entries {
                    if e.created_at > cutoff {
                        prop_assert!(!doomed_ids.contains(e.remote_id.as_str()));
                    }
                }
            }

            // Without an age rule, exactly the N most recent remain.
            if d_hours.is_none() {
                let expected: Vec<&str> = newest.iter().take(n).map(|e| e.remote_id.as_str()).collect();
                let actual: Vec<&str> = kept.iter().map(|e| e.remote_id.as_str()).collect();
                prop_assert_eq!(actual, expected);
            }
        }

        #[test]
        fn prop_protected_survives(
            count in 1usize..20,
            pick in 0usize..20,
            n in 1usize..5,
        ) {
            let now = Utc::now();
            let entries = history(now, count);
            let protected = entries[pick % count].remote_id.clone();
            let policy = RetentionPolicy::keep_last(n, 1);

            let doomed = plan_retention(&entries, &policy, now, Some(&protected));
            prop_assert!(doomed.iter().all(|e| e.remote_id != protected));
        }
    }

    #[tokio::test]
    async fn test_prune_deletes_oldest_of_six() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for e in history(now, 6) {
            store.insert_version("world", e);
        }

        let report = manager(&store)
            .prune(
                "world",
                &RetentionPolicy::keep_last(5, 2),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["v0".to_string()]);
        assert!(report.failures.is_empty());
        assert_eq!(report.kept, 5);
        assert_eq!(store.versions("world").len(), 5);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_stop_others() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for e in history(now, 5) {
            store.insert_version("world", e);
        }
        store.fail_deletes_for("v1");

        let report = manager(&store)
            .prune(
                "world",
                &RetentionPolicy::keep_last(2, 1),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["v0".to_string(), "v2".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "v1");
        assert_eq!(report.kept, 3);
    }

    #[tokio::test]
    async fn test_transient_list_failure_is_retried() {
        let store = MemoryStore::new();
        for e in history(Utc::now(), 3) {
            store.insert_version("world", e);
        }
        store.fail_next_lists(1);

        let report = manager(&store)
            .prune(
                "world",
                &RetentionPolicy::keep_last(2, 1),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["v0".to_string()]);
    }

    #[tokio::test]
    async fn test_list_failure_is_prune_failure() {
        let store = MemoryStore::new();
        store.fail_next_lists(10);

        let result = manager(&store)
            .prune(
                "world",
                &RetentionPolicy::default(),
                None,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::PruneFailure(_))));
    }

    #[tokio::test]
    async fn test_cancelled_prune_deletes_nothing() {
        let store = MemoryStore::new();
        for e in history(Utc::now(), 6) {
            store.insert_version("world", e);
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = manager(&store)
            .prune("world", &RetentionPolicy::keep_last(2, 1), None, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(report.deleted.is_empty());
        assert_eq!(store.versions("world").len(), 6);
    }

    #[tokio::test]
    async fn test_cancellation_stops_list_retries() {
        let store = MemoryStore::new();
        for e in history(Utc::now(), 4) {
            store.insert_version("world", e);
        }
        store.fail_next_lists(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = manager(&store)
            .prune("world", &RetentionPolicy::keep_last(2, 1), None, &cancel)
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(store.versions("world").len(), 4);
    }
}
