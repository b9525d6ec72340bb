//! Worldback backup pipeline
//!
//! This crate turns a live directory tree into remote backup versions:
//! - Archiver producing deterministic, consistent ZIP snapshots
//! - Credential store with single-flight OAuth refresh
//! - Resumable, retried chunked uploads
//! - Retention that never leaves fewer than the configured floor
//! - Orchestrator with per-source jobs, checkpoints and crash recovery
//! - Periodic scheduling with a final backup on host shutdown

pub mod archiver;
pub mod checkpoint;
pub mod config;
pub mod credentials;
pub mod job;
pub mod orchestrator;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod upload;

// Re-export main types
pub use archiver::{ArchiveOptions, Archiver, NoQuiescence, Quiescence, QuiescenceGuard, Snapshot};
pub use checkpoint::{CheckpointStore, JobCheckpoint};
pub use config::{default_config_path, default_data_dir, BackupConfig, TriggerPolicy};
pub use credentials::CredentialStore;
pub use job::{BackupJob, JobState};
pub use orchestrator::{source_id, source_name, BackupEvent, BackupOrchestrator, JobStatus, RequestOutcome};
pub use retention::{plan_retention, PruneReport, RetentionManager, RetentionPolicy};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::AutoBackupScheduler;
pub use upload::{IgnoreSession, SessionObserver, UploadManager, UploadReport, UploadSession};
