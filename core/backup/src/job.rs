//! Backup job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use worldback_common::{Error, JobId, Result};

/// Stage of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No job has run yet.
    Idle,
    /// Producing the snapshot.
    Archiving,
    /// Transferring the snapshot.
    Uploading,
    /// Applying retention.
    Pruning,
    /// The snapshot is stored remotely.
    Completed,
    /// The last attempt failed; a retry may follow.
    Failed,
    /// Given up.
    Abandoned,
}

impl JobState {
    /// Whether a job in this state is doing work.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobState::Archiving | JobState::Uploading | JobState::Pruning | JobState::Failed
        )
    }

    /// Whether the job has ended.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Abandoned)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle, Archiving)
                | (Archiving, Uploading)
                | (Uploading, Pruning)
                | (Pruning, Completed)
                | (Archiving | Uploading | Pruning, Failed)
                | (Failed, Archiving)
                | (Failed, Abandoned)
                | (Archiving | Uploading | Pruning, Abandoned)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Archiving => "archiving",
            JobState::Uploading => "uploading",
            JobState::Pruning => "pruning",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// One backup of one source, from trigger to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    /// Job identifier.
    pub id: JobId,
    /// Directory being backed up.
    pub source_path: PathBuf,
    /// When the job was triggered.
    pub created_at: DateTime<Utc>,
    /// Current stage.
    pub state: JobState,
    /// Attempts started so far (1-based once running).
    pub attempt: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
}

impl BackupJob {
    /// Create an idle job for `source_path`.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            id: JobId::new(),
            source_path: source_path.into(),
            created_at: Utc::now(),
            state: JobState::Idle,
            attempt: 0,
            last_error: None,
        }
    }

    /// Move to `next`.
    ///
    /// Entering `Archiving` starts a new attempt.
    ///
    /// # Errors
    /// - `InvalidInput` for transitions the state machine does not allow
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Job {}: illegal transition {} -> {}",
                self.id, self.state, next
            )));
        }
        if next == JobState::Archiving {
            self.attempt += 1;
        }
        self.state = next;
        Ok(())
    }

    /// Record a failure and move to `Failed`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.last_error = Some(error.into());
        self.transition(JobState::Failed)
    }

    /// Whether another attempt is allowed under `max_attempts`.
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.state == JobState::Failed && self.attempt < max_attempts
    }
}
