//! Periodic automatic backups and the final backup on host shutdown.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::orchestrator::{BackupOrchestrator, JobStatus, RequestOutcome};

struct Running {
    source: PathBuf,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Triggers backups of one source at a fixed interval.
pub struct AutoBackupScheduler {
    orchestrator: BackupOrchestrator,
    interval: Duration,
    enabled: bool,
    backup_on_shutdown: bool,
    running: Mutex<Option<Running>>,
}

impl AutoBackupScheduler {
    /// Scheduler using the orchestrator's configuration.
    pub fn new(orchestrator: BackupOrchestrator) -> Self {
        let config = orchestrator.config();
        let interval = config.backup_interval();
        let enabled = config.auto_backup_enabled;
        let backup_on_shutdown = config.backup_on_shutdown;

        Self {
            orchestrator,
            interval,
            enabled,
            backup_on_shutdown,
            running: Mutex::new(None),
        }
    }

    /// Override the period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Period between automatic backups.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the periodic timer is running.
    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// Start periodic backups of `source`. The first one fires after one
    /// interval.
    ///
    /// Returns `false` when automatic backups are disabled or the timer is
    /// already running.
    pub fn start(&self, source: impl AsRef<Path>) -> bool {
        if !self.enabled {
            debug!("Automatic backups are disabled");
            return false;
        }

        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let source = source.as_ref().to_path_buf();
        let stop = CancellationToken::new();
        let orchestrator = self.orchestrator.clone();
        let period = self.interval;
        let task_source = source.clone();
        let task_stop = stop.clone();

        let task = self.orchestrator.runtime().spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match orchestrator.request_backup(&task_source) {
                            Ok(RequestOutcome::Started(id)) => {
                                info!("Automatic backup {} of {:?} started", id, task_source)
                            }
                            Ok(outcome) => debug!("Automatic backup of {:?}: {:?}", task_source, outcome),
                            Err(e) => {
                                error!("Automatic backup of {:?} failed to start: {}", task_source, e);
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Backup timer for {:?} stopped", task_source);
        });

        info!(
            "Automatic backups of {:?} every {:?}",
            source, self.interval
        );
        *running = Some(Running { source, stop, task });
        true
    }

    /// Stop the periodic timer. A backup already running is not affected.
    pub async fn stop(&self) {
        let running = self.lock().take();
        if let Some(running) = running {
            running.stop.cancel();
            if let Err(e) = running.task.await {
                warn!("Backup timer for {:?} ended abnormally: {}", running.source, e);
            }
        }
    }

    /// Host is stopping: stop the timer and, if configured, run one last
    /// backup of `source` and wait for it.
    pub async fn on_host_stopping(&self, source: impl AsRef<Path>) -> Option<JobStatus> {
        self.stop().await;
        if !self.backup_on_shutdown {
            return None;
        }

        let source = source.as_ref();
        info!("Running final backup of {:?}", source);
        // An active job is waited for in both cases.
        if let Err(e) = self.orchestrator.request_backup(source) {
            warn!("Final backup of {:?} not started: {}", source, e);
            return None;
        }
        Some(self.orchestrator.wait(source).await)
    }
}
