//! Worldback CLI - Command line interface for world backups.
//!
//! This tool drives the backup pipeline from a terminal: authorizing the
//! remote, running one-off or periodic backups, and inspecting or pruning
//! the stored versions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use worldback_backup::{
    default_config_path, default_data_dir, source_id, source_name, AutoBackupScheduler, BackupConfig,
    BackupOrchestrator, CheckpointStore, CredentialStore, JobState, JobStatus, NoQuiescence,
    RequestOutcome,
};
use worldback_storage::gdrive::LoopbackReceiver;
use worldback_storage::{create_default_registry, normalize_name, GoogleAuth, OAuthConfig, RemoteStore};

#[derive(Parser)]
#[command(name = "worldback")]
#[command(about = "Worldback - Automated world backups")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/worldback/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Remote store: "googledrive", "local" or "memory" (overrides config).
    #[arg(long)]
    store: Option<String>,

    /// Directory used as the remote by the local store.
    #[arg(long)]
    local_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize access to Google Drive.
    Auth,

    /// Forget the stored Google Drive credential.
    SignOut,

    /// Back up a world once and wait for the result.
    Backup {
        /// World directory.
        #[arg(short, long)]
        source: PathBuf,
    },

    /// List the stored versions of a world.
    List {
        /// World directory.
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Apply the retention policy to a world's versions.
    Prune {
        /// World directory.
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Back up periodically until interrupted, then once more.
    Run {
        /// World directory.
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Finish backups interrupted by a crash or shutdown.
    Recover,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = BackupConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if let Some(store) = &cli.store {
        config.store = store.clone();
    }

    match cli.command {
        Commands::Auth => cmd_auth(&config).await,
        Commands::SignOut => cmd_sign_out(&config).await,
        Commands::Backup { source } => {
            cmd_backup(open_orchestrator(config, cli.local_root.as_deref())?, &source).await
        }
        Commands::List { source } => {
            cmd_list(open_orchestrator(config, cli.local_root.as_deref())?, &source).await
        }
        Commands::Prune { source } => {
            cmd_prune(open_orchestrator(config, cli.local_root.as_deref())?, &source).await
        }
        Commands::Run { source } => {
            cmd_run(open_orchestrator(config, cli.local_root.as_deref())?, &source).await
        }
        Commands::Recover => cmd_recover(open_orchestrator(config, cli.local_root.as_deref())?).await,
    }
}

fn is_google_drive(config: &BackupConfig) -> bool {
    normalize_name(&config.store) == "googledrive"
}

fn google_auth(config: &BackupConfig) -> Result<Arc<GoogleAuth>> {
    let oauth = OAuthConfig::from_client_secrets_file(&config.client_secrets_path).with_context(|| {
        format!(
            "Failed to read client secrets {}",
            config.client_secrets_path.display()
        )
    })?;
    Ok(Arc::new(GoogleAuth::new(oauth).context("Failed to set up OAuth client")?))
}

fn credential_store(config: &BackupConfig) -> Result<Arc<CredentialStore>> {
    if !is_google_drive(config) {
        return Ok(Arc::new(CredentialStore::anonymous()));
    }
    let auth = google_auth(config)?;
    Ok(Arc::new(
        CredentialStore::new(&config.credentials_path, auth).with_margin(config.refresh_margin()),
    ))
}

fn remote_store(config: &BackupConfig, local_root: Option<&Path>) -> Result<Arc<dyn RemoteStore>> {
    let registry = create_default_registry()?;
    let store_config = match normalize_name(&config.store).as_str() {
        "local" => {
            let root = local_root
                .map(Path::to_path_buf)
                .unwrap_or_else(|| default_data_dir().join("remote"));
            serde_json::json!({ "root": root.to_string_lossy() })
        }
        _ => serde_json::Value::Null,
    };

    registry
        .resolve(&config.store, store_config)
        .with_context(|| format!("Failed to open store '{}'", config.store))
}

fn open_orchestrator(config: BackupConfig, local_root: Option<&Path>) -> Result<BackupOrchestrator> {
    let store = remote_store(&config, local_root)?;
    let credentials = credential_store(&config)?;
    info!("Using store '{}'", store.name());

    BackupOrchestrator::new(config, store, credentials, Arc::new(NoQuiescence))
        .context("Failed to start backup orchestrator")
}

fn print_status(source: &Path, status: &JobStatus) {
    println!("Backup of {}:", source.display());
    println!("  State: {}", status.state);
    println!("  Attempts: {}", status.attempt);
    if let Some(job_id) = &status.job_id {
        println!("  Job: {}", job_id);
    }
    if let Some(remote_id) = &status.last_remote_id {
        println!("  Remote ID: {}", remote_id);
    }
    if let Some(at) = &status.last_success_at {
        println!("  Last success: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &status.last_error {
        println!("  Error: {}", error);
    }
}

/// Run the OAuth authorization flow.
async fn cmd_auth(config: &BackupConfig) -> Result<()> {
    let auth = google_auth(config)?;
    let (url, state) = auth.authorization_url();
    let receiver = LoopbackReceiver::bind(&auth.config().redirect_url)
        .await
        .context("Failed to listen for the OAuth redirect")?;

    println!("Open this URL to authorize Worldback:\n\n  {}\n", url);
    if let Err(e) = open::that(&url) {
        warn!("Could not open a browser: {}", e);
    }

    let code = receiver
        .wait_for_code(&state)
        .await
        .context("Authorization failed")?;
    let credential = auth
        .exchange_code(&code)
        .await
        .context("Failed to exchange authorization code")?;

    let credentials = CredentialStore::new(&config.credentials_path, auth);
    credentials
        .store(credential)
        .await
        .context("Failed to save credential")?;

    println!("Authorized. Credential saved to {}", config.credentials_path.display());
    Ok(())
}

/// Delete the stored credential.
async fn cmd_sign_out(config: &BackupConfig) -> Result<()> {
    let credentials = CredentialStore::new(&config.credentials_path, google_auth(config)?);
    credentials.sign_out().await.context("Failed to sign out")?;
    println!("Signed out.");
    Ok(())
}

/// Run one backup job.
async fn cmd_backup(orchestrator: BackupOrchestrator, source: &Path) -> Result<()> {
    match orchestrator.request_backup(source)? {
        RequestOutcome::Started(id) => info!("Started backup job {}", id),
        outcome => info!("Backup already running ({:?})", outcome),
    }

    let status = orchestrator.wait(source).await;
    print_status(source, &status);

    if status.state != JobState::Completed {
        anyhow::bail!("Backup did not complete");
    }
    Ok(())
}

/// List remote versions.
async fn cmd_list(orchestrator: BackupOrchestrator, source: &Path) -> Result<()> {
    let name = source_name(source);
    let versions = orchestrator
        .retention()
        .list(&source_id(source), &CancellationToken::new())
        .await
        .context("Failed to list backups")?;

    if versions.is_empty() {
        println!("No backups of {}.", name);
    } else {
        println!("Backups of {}:", name);
        for entry in versions {
            println!(
                "  {}  {} ({} bytes) [{}]",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.name,
                entry.size_bytes,
                entry.remote_id
            );
        }
    }

    Ok(())
}

/// Apply retention now.
async fn cmd_prune(orchestrator: BackupOrchestrator, source: &Path) -> Result<()> {
    let policy = orchestrator.config().retention.clone();
    let report = orchestrator
        .retention()
        .prune(&source_id(source), &policy, None, &CancellationToken::new())
        .await
        .context("Failed to prune backups")?;

    for id in &report.deleted {
        println!("Deleted {}", id);
    }
    for (id, reason) in &report.failures {
        println!("Could not delete {}: {}", id, reason);
    }
    println!("{} deleted, {} kept.", report.deleted.len(), report.kept);

    Ok(())
}

/// Back up periodically until Ctrl-C.
async fn cmd_run(orchestrator: BackupOrchestrator, source: &Path) -> Result<()> {
    orchestrator.recover().await.context("Failed to recover jobs")?;

    let scheduler = AutoBackupScheduler::new(orchestrator.clone());
    if scheduler.start(source) {
        println!(
            "Backing up {} every {:?}. Press Ctrl-C to stop.",
            source.display(),
            scheduler.interval()
        );
    } else {
        println!("Automatic backups are disabled. Press Ctrl-C to stop.");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Stopping");

    if let Some(status) = scheduler.on_host_stopping(source).await {
        print_status(source, &status);
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// Resume interrupted jobs and wait for them.
async fn cmd_recover(orchestrator: BackupOrchestrator) -> Result<()> {
    let pending = CheckpointStore::new(&orchestrator.config().staging_dir)
        .load_all()
        .await
        .context("Failed to read checkpoints")?;

    let resumed = orchestrator.recover().await.context("Failed to recover jobs")?;
    if resumed.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }

    for checkpoint in pending
        .iter()
        .filter(|checkpoint| resumed.contains(&checkpoint.job_id))
    {
        let status = orchestrator.wait(&checkpoint.source_path).await;
        print_status(&checkpoint.source_path, &status);
    }

    Ok(())
}
