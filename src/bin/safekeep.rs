//! # Safekeep CLI - Backups for single data files
//!
//! Command-line access to the backups safekeep keeps for a managed file.
//!
//! ## Features
//! - Create, list and prune timestamped backups of a file
//! - Restore from the newest backup, or roll back to the newest readable one
//! - Structural diff of two JSON documents
//! - SHA-256 of a file, as used for remote change detection
//!
//! ## Usage
//! ```bash
//! # Back up a file next to itself
//! safekeep backup settings.json
//!
//! # Keep at most 5 backups, none older than a week, in a separate directory
//! safekeep --backup-dir backups --max-backups 5 --retention 7days backup settings.json
//!
//! # Roll back past corrupt backups
//! safekeep restore settings.json --rollback --max-retries 3
//!
//! # What changed between two versions
//! safekeep diff old.json new.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use safekeep::json_diff::{self, ChangeKind};
use safekeep::utils::{format_bytes, hash_file_content};
use safekeep::{
    BackupStore, FileManager, JsonSerializer, Result, RollbackCallback, RollbackDetails,
    RollbackOptions, RollbackOutcome, SafekeepConfig, SafekeepError, TextSerializer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Safekeep CLI - backup, restore and inspect managed data files
#[derive(Parser)]
#[command(name = "safekeep")]
#[command(version)]
#[command(about = "Backups, rollback and diffs for application data files")]
#[command(long_about = None)]
struct Cli {
    /// Directory holding backups (defaults to next to the file)
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// Maximum number of backups kept
    #[arg(long, global = true)]
    max_backups: Option<usize>,

    /// Delete backups older than this (e.g. "30days", "12h")
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    retention: Option<Duration>,

    /// Backup filename pattern ({filename}, {stem}, {ext}, {timestamp})
    #[arg(long, global = true)]
    pattern: Option<String>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup of a file
    #[command(alias = "bk")]
    Backup {
        /// File to back up
        file: PathBuf,
    },

    /// List the backups of a file
    #[command(alias = "ls")]
    List {
        /// Managed file
        file: PathBuf,
    },

    /// Apply the retention policy to a file's backups
    Prune {
        /// Managed file
        file: PathBuf,
    },

    /// Restore a file from its backups
    #[command(alias = "rs")]
    Restore {
        /// Managed file
        file: PathBuf,

        /// Fall back to older backups when the newest cannot be decoded
        #[arg(long)]
        rollback: bool,

        /// Older backups to try after the newest (negative = all)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        max_retries: i32,

        /// Pause between attempts (e.g. "200ms")
        #[arg(long, value_parser = humantime::parse_duration)]
        retry_delay: Option<Duration>,

        /// How file content is validated
        #[arg(long, value_enum, default_value = "auto")]
        format: Format,
    },

    /// Compare two JSON documents
    Diff {
        /// Previous version
        old: PathBuf,

        /// New version
        new: PathBuf,
    },

    /// Print the SHA-256 of a file
    Hash {
        /// File to hash
        file: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Format {
    /// JSON for `.json` files, UTF-8 text otherwise
    Auto,
    Json,
    Text,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if cli.verbose { "safekeep=debug" } else { "safekeep=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Backup { file } => cmd_backup(&config, &file).await,
        Commands::List { file } => cmd_list(&config, &file).await,
        Commands::Prune { file } => cmd_prune(&config, &file).await,
        Commands::Restore {
            file,
            rollback,
            max_retries,
            retry_delay,
            format,
        } => {
            let options = RollbackOptions {
                max_retries,
                retry_delay: retry_delay.unwrap_or(config.rollback.retry_delay),
                throw_on_all_failed: false,
            };
            cmd_restore(&config, &file, rollback, options, format).await
        }
        Commands::Diff { old, new } => cmd_diff(&old, &new).await,
        Commands::Hash { file } => cmd_hash(&file),
    }
}

/// Configuration file (if any) with command-line overrides applied
fn load_config(cli: &Cli) -> Result<SafekeepConfig> {
    let mut config = match &cli.config {
        Some(path) => SafekeepConfig::from_file(path)?,
        None => SafekeepConfig::default(),
    };

    if let Some(dir) = &cli.backup_dir {
        config.backup.backup_dir = Some(dir.clone());
    }
    if let Some(max) = cli.max_backups {
        config.backup.max_backup_count = max;
    }
    if let Some(retention) = cli.retention {
        config.backup.retention_period = Some(retention);
    }
    if let Some(pattern) = &cli.pattern {
        config.backup.filename_pattern = pattern.clone();
    }

    config.validate()?;
    Ok(config)
}

fn store_for(config: &SafekeepConfig, file: &Path) -> Result<BackupStore> {
    BackupStore::new(std::path::absolute(file)?, config.backup.clone())
}

/// Create a backup
async fn cmd_backup(config: &SafekeepConfig, file: &Path) -> Result<()> {
    let store = store_for(config, file)?;
    let backup = store.create_backup().await?;
    println!(
        "{} Backed up {} to {}",
        "✓".green().bold(),
        file.display(),
        backup.display().to_string().cyan()
    );
    Ok(())
}

/// List backups, newest first
async fn cmd_list(config: &SafekeepConfig, file: &Path) -> Result<()> {
    let store = store_for(config, file)?;
    let backups = store.list_backups().await?;

    if backups.is_empty() {
        println!("{}", "No backups found.".yellow());
        return Ok(());
    }

    println!(
        "{} {}",
        "Backups of".blue().bold(),
        file.display().to_string().blue().bold()
    );
    println!();
    for (index, backup) in backups.iter().enumerate() {
        let marker = if index == 0 { "*".green().bold() } else { " ".normal() };
        println!(
            "{} {} {:>10}  {}",
            marker,
            backup
                .created_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed(),
            format_bytes(backup.size),
            backup.file_name().yellow()
        );
    }
    println!();
    println!("Total: {} backup(s) in {}", backups.len(), store.backup_dir().display());
    Ok(())
}

/// Apply the retention policy
async fn cmd_prune(config: &SafekeepConfig, file: &Path) -> Result<()> {
    let store = store_for(config, file)?;
    let deleted = store.prune().await?;
    if deleted == 0 {
        println!("{}", "Nothing to prune.".yellow());
    } else {
        println!("{} Deleted {} backup(s)", "✓".green().bold(), deleted);
    }
    Ok(())
}

/// Restore from backups
async fn cmd_restore(
    config: &SafekeepConfig,
    file: &Path,
    rollback: bool,
    options: RollbackOptions,
    format: Format,
) -> Result<()> {
    let json = match format {
        Format::Json => true,
        Format::Text => false,
        Format::Auto => safekeep::utils::is_json_path(file),
    };

    if json {
        let manager = FileManager::<serde_json::Value>::builder(file)
            .serializer(JsonSerializer::pretty())
            .backup_config(config.backup.clone())
            .auto_save(false)
            .build()?;
        restore_with(&manager, rollback, options).await
    } else {
        let manager = FileManager::<String>::builder(file)
            .serializer(TextSerializer)
            .backup_config(config.backup.clone())
            .auto_save(false)
            .build()?;
        restore_with(&manager, rollback, options).await
    }
}

async fn restore_with<T>(manager: &FileManager<T>, rollback: bool, options: RollbackOptions) -> Result<()>
where
    T: Clone + Send + Sync + 'static,
{
    if !rollback {
        manager.restore_from_latest_backup().await?;
        println!(
            "{} Restored {} from the latest backup",
            "✓".green().bold(),
            manager.path().display()
        );
        return Ok(());
    }

    let report: RollbackCallback = Arc::new(|details: &RollbackDetails| {
        for (path, reason) in details.tried_paths.iter().zip(&details.reasons) {
            println!("  {} {} ({})", "✗".red(), path.display(), reason.dimmed());
        }
    });

    match manager.restore_with_rollback(options, Some(report)).await? {
        RollbackOutcome::Recovered { index: 0, path, .. } => {
            println!(
                "{} Restored {} from {}",
                "✓".green().bold(),
                manager.path().display(),
                path.display()
            );
            Ok(())
        }
        RollbackOutcome::Recovered { index, path, .. } => {
            println!(
                "{} Rolled back {} to {} ({} newer backup(s) unusable)",
                "✓".yellow().bold(),
                manager.path().display(),
                path.display(),
                index
            );
            Ok(())
        }
        RollbackOutcome::Exhausted {
            tried_paths,
            reasons,
        } => Err(SafekeepError::FullRollbackFailure {
            tried_paths,
            reasons,
        }),
    }
}

/// Print a structural JSON diff
async fn cmd_diff(old: &Path, new: &Path) -> Result<()> {
    let old_text = match tokio::fs::read_to_string(old).await {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let new_text = tokio::fs::read_to_string(new)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SafekeepError::NotFound(new.to_path_buf()),
            _ => SafekeepError::Io(e),
        })?;

    let report = json_diff::diff(old_text.as_deref(), &new_text)?;
    if !report.has_changes {
        println!("{}", "No changes.".yellow());
        return Ok(());
    }

    for change in &report.changes {
        let line = change.to_string();
        match change.kind {
            ChangeKind::Added => println!("{}", line.green()),
            ChangeKind::Removed => println!("{}", line.red()),
            ChangeKind::Modified => println!("{}", line.yellow()),
        }
    }
    println!();
    println!("{}", report.summary().bold());
    Ok(())
}

/// Print a file's SHA-256
fn cmd_hash(file: &Path) -> Result<()> {
    let hash = hash_file_content(file)?;
    println!("{}  {}", hash, file.display());
    Ok(())
}
