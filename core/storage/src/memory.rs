//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::provider::{ChunkAck, ObjectSpec, RemoteSession, RemoteStore, RetentionEntry};
use worldback_common::{Error, Result};

/// Counters describing what the store actually received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Sessions allocated.
    pub sessions_created: u32,
    /// Chunks stored (injected failures and rejected offsets excluded).
    pub chunks_accepted: u32,
    /// Payload bytes stored across all sessions.
    pub bytes_received: u64,
    /// Chunk requests answered with an injected failure.
    pub injected_failures: u32,
    /// Objects deleted.
    pub deletes: u32,
}

#[derive(Debug)]
struct Session {
    object: ObjectSpec,
    data: Vec<u8>,
    expires_at: DateTime<Utc>,
    completed: Option<String>,
}

#[derive(Debug)]
struct Object {
    source: String,
    entry: RetentionEntry,
    data: Vec<u8>,
}

#[derive(Debug)]
struct State {
    sessions: HashMap<String, Session>,
    objects: BTreeMap<String, Object>,
    required_token: Option<String>,
    fail_next_chunks: u32,
    drop_next_acks: u32,
    fail_next_lists: u32,
    fail_deletes: HashSet<String>,
    session_ttl: Duration,
    stats: MemoryStats,
}

/// In-memory remote store.
///
/// Behaves like a resumable-upload service: chunks at the wrong offset
/// are answered with the current acknowledgement instead of being stored.
/// Failures can be injected to exercise retry and resume paths. All data
/// is lost on drop.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                sessions: HashMap::new(),
                objects: BTreeMap::new(),
                required_token: None,
                fail_next_chunks: 0,
                drop_next_acks: 0,
                fail_next_lists: 0,
                fail_deletes: HashSet::new(),
                session_ttl: Duration::days(7),
                stats: MemoryStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Only accept requests carrying `token`; anything else is `Unauthorized`.
    pub fn require_token(&self, token: Option<&str>) {
        self.lock().required_token = token.map(String::from);
    }

    /// Answer the next `count` chunk uploads with a transient failure
    /// without storing their data.
    pub fn fail_next_chunks(&self, count: u32) {
        self.lock().fail_next_chunks = count;
    }

    /// Store the next `count` chunks but lose the acknowledgement.
    pub fn drop_next_acks(&self, count: u32) {
        self.lock().drop_next_acks = count;
    }

    /// Answer the next `count` listings with a transient failure.
    pub fn fail_next_lists(&self, count: u32) {
        self.lock().fail_next_lists = count;
    }

    /// Make every delete of `remote_id` fail permanently.
    pub fn fail_deletes_for(&self, remote_id: &str) {
        self.lock().fail_deletes.insert(remote_id.to_string());
    }

    /// Lifetime given to new sessions.
    pub fn set_session_ttl(&self, ttl: Duration) {
        self.lock().session_ttl = ttl;
    }

    /// Drop every open session, as a remote would after expiry.
    pub fn expire_sessions(&self) {
        self.lock()
            .sessions
            .retain(|_, session| session.completed.is_some());
    }

    /// Seed an existing version for `source`.
    pub fn insert_version(&self, source: &str, entry: RetentionEntry) {
        let data = vec![0u8; entry.size_bytes as usize];
        self.lock().objects.insert(
            entry.remote_id.clone(),
            Object {
                source: source.to_string(),
                entry,
                data,
            },
        );
    }

    /// Versions currently stored for `source`, oldest first.
    pub fn versions(&self, source: &str) -> Vec<RetentionEntry> {
        let mut entries: Vec<RetentionEntry> = self
            .lock()
            .objects
            .values()
            .filter(|o| o.source == source)
            .map(|o| o.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    /// Content of a stored object.
    pub fn object_data(&self, remote_id: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(remote_id).map(|o| o.data.clone())
    }

    /// Number of stored objects across all sources.
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Sessions the store still tracks, finished or not.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    fn check_token(state: &State, token: &str) -> Result<()> {
        match &state.required_token {
            Some(required) if required != token => {
                Err(Error::Unauthorized("Invalid or expired token".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn live_session<'a>(
        state: &'a mut State,
        session: &RemoteSession,
    ) -> Result<&'a mut Session> {
        let now = Utc::now();
        let expired = match state.sessions.get(&session.session_uri) {
            None => {
                return Err(Error::SessionExpired(format!(
                    "Unknown session: {}",
                    session.session_uri
                )))
            }
            Some(s) => s.completed.is_none() && s.expires_at <= now,
        };

        if expired {
            state.sessions.remove(&session.session_uri);
            return Err(Error::SessionExpired(format!(
                "Session expired: {}",
                session.session_uri
            )));
        }

        state
            .sessions
            .get_mut(&session.session_uri)
            .ok_or_else(|| Error::SessionExpired(session.session_uri.clone()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_session(&self, token: &str, object: &ObjectSpec) -> Result<RemoteSession> {
        let mut state = self.lock();
        Self::check_token(&state, token)?;

        let session_uri = format!("memory://upload/{}", Uuid::new_v4());
        let expires_at = Utc::now() + state.session_ttl;

        state.sessions.insert(
            session_uri.clone(),
            Session {
                object: object.clone(),
                data: Vec::with_capacity(object.size_bytes as usize),
                expires_at,
                completed: None,
            },
        );
        state.stats.sessions_created += 1;

        Ok(RemoteSession {
            session_uri,
            expires_at,
        })
    }

    async fn query_session(
        &self,
        token: &str,
        session: &RemoteSession,
        _total_size: u64,
    ) -> Result<ChunkAck> {
        let mut state = self.lock();
        Self::check_token(&state, token)?;
        let live = Self::live_session(&mut state, session)?;

        let ack = match &live.completed {
            Some(remote_id) => ChunkAck::Complete {
                remote_id: remote_id.clone(),
            },
            None => ChunkAck::Incomplete {
                bytes_confirmed: live.data.len() as u64,
            },
        };
        // The client now knows the outcome; the session is done.
        if matches!(ack, ChunkAck::Complete { .. }) {
            state.sessions.remove(&session.session_uri);
        }
        Ok(ack)
    }

    async fn upload_chunk(
        &self,
        token: &str,
        session: &RemoteSession,
        offset: u64,
        data: &[u8],
        total_size: u64,
    ) -> Result<ChunkAck> {
        let mut guard = self.lock();
        let state = &mut *guard;
        Self::check_token(state, token)?;
        Self::live_session(state, session)?;

        if state.fail_next_chunks > 0 {
            state.fail_next_chunks -= 1;
            state.stats.injected_failures += 1;
            return Err(Error::Network("Injected transient failure".to_string()));
        }

        let live = state
            .sessions
            .get_mut(&session.session_uri)
            .ok_or_else(|| Error::SessionExpired(session.session_uri.clone()))?;

        if let Some(remote_id) = &live.completed {
            return Ok(ChunkAck::Complete {
                remote_id: remote_id.clone(),
            });
        }

        let confirmed = live.data.len() as u64;
        if offset != confirmed || confirmed + data.len() as u64 > total_size {
            return Ok(ChunkAck::Incomplete {
                bytes_confirmed: confirmed,
            });
        }

        live.data.extend_from_slice(data);
        state.stats.chunks_accepted += 1;
        state.stats.bytes_received += data.len() as u64;
        let confirmed = live.data.len() as u64;

        let ack = if confirmed == total_size {
            let remote_id = format!("mem-{}", Uuid::new_v4().simple());
            live.completed = Some(remote_id.clone());
            let entry = RetentionEntry {
                remote_id: remote_id.clone(),
                name: live.object.name.clone(),
                created_at: Utc::now(),
                source_version: live.object.source_version.clone(),
                size_bytes: confirmed,
                checksum: Some(live.object.checksum.clone()),
            };
            let object = Object {
                source: live.object.source.clone(),
                entry,
                data: std::mem::take(&mut live.data),
            };
            state.objects.insert(remote_id.clone(), object);
            ChunkAck::Complete { remote_id }
        } else {
            ChunkAck::Incomplete {
                bytes_confirmed: confirmed,
            }
        };

        if state.drop_next_acks > 0 {
            state.drop_next_acks -= 1;
            state.stats.injected_failures += 1;
            return Err(Error::Network("Injected lost acknowledgement".to_string()));
        }

        Ok(ack)
    }

    async fn list_versions(&self, token: &str, source: &str) -> Result<Vec<RetentionEntry>> {
        {
            let mut state = self.lock();
            Self::check_token(&state, token)?;
            if state.fail_next_lists > 0 {
                state.fail_next_lists -= 1;
                return Err(Error::Network("Injected listing failure".to_string()));
            }
        }
        Ok(self.versions(source))
    }

    async fn delete_object(&self, token: &str, remote_id: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_token(&state, token)?;

        if state.fail_deletes.contains(remote_id) {
            return Err(Error::NotPermitted(format!("Delete refused: {}", remote_id)));
        }

        match state.objects.remove(remote_id) {
            Some(_) => {
                state
                    .sessions
                    .retain(|_, session| session.completed.as_deref() != Some(remote_id));
                state.stats.deletes += 1;
                Ok(())
            }
            None => Err(Error::NotFound(format!("Object not found: {}", remote_id))),
        }
    }
}
