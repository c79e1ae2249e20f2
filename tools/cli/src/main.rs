//! KeepSync CLI - Command line interface for the data-reliability core.
//!
//! This tool drives the retry queue, the connectivity prober and the
//! backup engine against the application's data directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use keepsync_app::{AppConfig, AppContext};
use keepsync_backup::{BackupManifest, CreateOptions};
use keepsync_common::{BackupId, LogNotifier};
use keepsync_sync::{NewOperation, ProcessOutcome};

#[derive(Parser)]
#[command(name = "keepsync")]
#[command(about = "KeepSync - Offline-tolerant sync queue and backups")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <data dir>/keepsync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and drive the sync queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Check connectivity once and print the result.
    Probe,

    /// Create and restore backups.
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Add an operation to the queue.
    Enqueue {
        /// Operation type, e.g. "create" or "update".
        #[arg(short = 't', long = "type")]
        op_type: String,

        /// Entity the operation applies to.
        #[arg(short, long)]
        entity: String,

        /// Payload sent to the backend.
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Run one processing pass.
    Process,

    /// Show queue counters.
    Status,

    /// List queued operations.
    List,

    /// Remove every operation from the queue.
    Clear,

    /// Reset failed operations to pending.
    RetryFailed,
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a backup.
    Create {
        /// Leave the database file out.
        #[arg(long)]
        no_database: bool,
    },

    /// List recorded backups.
    List,

    /// Restore a recorded backup.
    Restore {
        /// Backup id.
        id: String,
    },

    /// Restore an archive file that is not in the history.
    RestoreFile {
        /// Path to the .tar.gz archive.
        path: PathBuf,
    },

    /// Delete a backup.
    Delete {
        /// Backup id.
        id: String,
    },

    /// Check a backup without restoring it.
    Validate {
        /// Backup id.
        id: String,
    },
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

    let config = load_config(cli.config.as_deref())?;
    let ctx = AppContext::new(config, Arc::new(LogNotifier))
        .context("Failed to initialize KeepSync")?;

    let result = match cli.command {
        Commands::Queue { command } => run_queue(&ctx, command).await,
        Commands::Probe => cmd_probe(&ctx).await,
        Commands::Backup { command } => run_backup(&ctx, command).await,
    };

    ctx.shutdown().await;
    result
}

/// Load the configuration file. The CLI drives processing explicitly, so
/// enqueue never starts a pass on its own.
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(path) => Some(path.to_path_buf()),
        None => AppConfig::default_path(),
    };

    let mut config = match &path {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => AppConfig::default(),
    };
    config.queue.auto_sync = false;
    Ok(config)
}

async fn run_queue(ctx: &AppContext, command: QueueCommands) -> Result<()> {
    match command {
        QueueCommands::Enqueue {
            op_type,
            entity,
            data,
        } => cmd_enqueue(ctx, &op_type, &entity, data),
        QueueCommands::Process => cmd_process(ctx).await,
        QueueCommands::Status => cmd_status(ctx).await,
        QueueCommands::List => cmd_list(ctx),
        QueueCommands::Clear => {
            let removed = ctx.queue.clear().context("Failed to clear queue")?;
            println!("Removed {} operations.", removed);
            Ok(())
        }
        QueueCommands::RetryFailed => {
            let reset = ctx.queue.retry_failed().context("Failed to reset operations")?;
            println!("Reset {} failed operations to pending.", reset);
            Ok(())
        }
    }
}

fn cmd_enqueue(ctx: &AppContext, op_type: &str, entity: &str, data: String) -> Result<()> {
    let id = ctx
        .queue
        .enqueue(NewOperation::new(op_type, entity, data.into_bytes()))
        .context("Failed to enqueue operation")?;

    println!("Operation queued: {}", id);
    Ok(())
}

async fn cmd_process(ctx: &AppContext) -> Result<()> {
    ctx.prober.check_now().await;

    match ctx.queue.process().await.context("Sync pass failed")? {
        ProcessOutcome::Completed(summary) => {
            println!("Sync pass complete:");
            println!("  Synced: {}", summary.processed);
            println!("  Failed: {}", summary.failed);
            println!("  Pending: {}", summary.pending);
        }
        ProcessOutcome::Skipped(reason) => {
            println!("Sync pass skipped: {:?}", reason);
        }
    }
    Ok(())
}

async fn cmd_status(ctx: &AppContext) -> Result<()> {
    ctx.prober.check_now().await;
    let status = ctx.queue.status();

    println!("Queue status:");
    println!("  Total: {}", status.total);
    println!("  Pending: {}", status.pending);
    println!("  Synced: {}", status.synced);
    println!("  Failed: {}", status.failed);
    println!("  Online: {}", status.online);
    println!("  Adapter: {}", if status.adapter_configured { "configured" } else { "none" });
    Ok(())
}

fn cmd_list(ctx: &AppContext) -> Result<()> {
    let operations = ctx.queue.operations();
    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    for op in operations {
        let status = serde_json::to_value(op.status)?;
        println!(
            "  {} {:<8} {} {} (retries: {}, queued: {})",
            op.id,
            status.as_str().unwrap_or_default(),
            op.op_type,
            op.entity,
            op.retries,
            op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &op.error {
            println!("      last error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_probe(ctx: &AppContext) -> Result<()> {
    info!("Probing {}", ctx.prober.config().endpoint);
    let online = ctx.prober.check_now().await;
    println!("{}", if online { "online" } else { "offline" });
    Ok(())
}

async fn run_backup(ctx: &AppContext, command: BackupCommands) -> Result<()> {
    match command {
        BackupCommands::Create { no_database } => {
            let options = CreateOptions::default().with_include_database(!no_database);
            let manifest = ctx
                .backups
                .create(options)
                .await
                .context("Failed to create backup")?;
            println!("Backup created successfully!");
            print_manifest(&manifest);
        }
        BackupCommands::List => {
            let history = ctx.backups.list().context("Failed to read backup history")?;
            if history.is_empty() {
                println!("No backups.");
            }
            for manifest in history {
                println!(
                    "  {} [{}] {} ({} bytes)",
                    manifest.id,
                    manifest.kind,
                    manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
                    manifest.size_bytes.unwrap_or(0)
                );
            }
        }
        BackupCommands::Restore { id } => {
            let id = BackupId::new(id).context("Invalid backup id")?;
            let manifest = ctx
                .restore_backup(&id)
                .await
                .context("Failed to restore backup")?;
            println!("Backup {} restored ({}).", manifest.id, manifest.includes.join(", "));
        }
        BackupCommands::RestoreFile { path } => {
            let manifest = ctx
                .restore_backup_from_path(&path)
                .await
                .with_context(|| format!("Failed to restore {}", path.display()))?;
            println!("Backup {} restored ({}).", manifest.id, manifest.includes.join(", "));
        }
        BackupCommands::Delete { id } => {
            let id = BackupId::new(id).context("Invalid backup id")?;
            ctx.backups.delete(&id).context("Failed to delete backup")?;
            println!("Backup {} deleted.", id);
        }
        BackupCommands::Validate { id } => {
            let id = BackupId::new(id).context("Invalid backup id")?;
            let report = ctx
                .backups
                .validate(&id)
                .await
                .context("Failed to validate backup")?;
            println!("Backup {}:", report.id);
            println!("  File present: {}", report.file_exists);
            match report.checksum_matches {
                Some(matches) => println!("  Checksum matches: {}", matches),
                None => println!("  Checksum matches: unknown"),
            }
            println!("  Manifest readable: {}", report.manifest_readable);
            if !report.is_valid() {
                anyhow::bail!("Backup {} is not valid", report.id);
            }
        }
    }
    Ok(())
}

fn print_manifest(manifest: &BackupManifest) {
    println!("  ID: {}", manifest.id);
    println!("  File: {}", manifest.file_name);
    println!("  Includes: {}", manifest.includes.join(", "));
    if let Some(size) = manifest.size_bytes {
        println!("  Size: {} bytes", size);
    }
    if let Some(checksum) = &manifest.checksum {
        println!("  SHA-256: {}", checksum);
    }
}
