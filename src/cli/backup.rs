//! Backup CLI commands
//!
//! Create, inspect, delete and clean up archives.

use clap::Subcommand;
use std::time::Duration;

use super::{passphrase, resolve_backup_id, split_collections};
use crate::backup::{format_size, CreateBackupRequest};
use crate::display::{format_backup_details, format_backup_list};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::BackupType;

/// Backup subcommands
#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a new backup
    Create {
        /// Backup type: full, incremental or selective
        #[arg(short = 't', long = "type", default_value = "full")]
        backup_type: String,

        /// Collections to include (comma separated)
        #[arg(short, long, value_delimiter = ',')]
        collections: Vec<String>,

        /// Write an uncompressed archive
        #[arg(long)]
        no_compress: bool,

        /// Encrypt the archive with a passphrase
        #[arg(long)]
        encrypt: bool,

        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,

        /// Who is creating the backup
        #[arg(long = "by", env = "CMS_BACKUP_USER", default_value = "admin")]
        created_by: String,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List recent backups
    List {
        /// Number of backups to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show details of a backup (use 'latest' for most recent)
    Show {
        /// Backup id
        backup: String,
    },

    /// Delete a backup and its archive file
    Delete {
        /// Backup id
        backup: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Delete backups older than the retention period
    Cleanup {
        /// Retention period in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u32>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

/// Handle a backup command
pub fn handle_backup_command(engine: &Engine, cmd: BackupCommands) -> EngineResult<()> {
    match cmd {
        BackupCommands::Create {
            backup_type,
            collections,
            no_compress,
            encrypt,
            description,
            created_by,
            timeout,
        } => {
            let backup_type = BackupType::parse(&backup_type).ok_or_else(|| {
                EngineError::Validation(format!(
                    "Invalid backup type: '{}'. Valid types: full, incremental, selective",
                    backup_type
                ))
            })?;

            let mut request = CreateBackupRequest::new(backup_type, created_by)
                .compressed(!no_compress && engine.settings().compress_by_default);
            if let Some(names) = split_collections(&collections) {
                request = request.with_collections(names);
            }
            request.description = description;
            request.timeout = timeout.map(Duration::from_secs);
            if encrypt {
                request.passphrase = Some(passphrase::new_passphrase()?);
            }

            println!("Creating {} backup...", backup_type);
            let outcome = engine.backups().create_backup(request)?;
            println!("{}", outcome.message);
            println!("Backup ID: {}", outcome.backup_id);
            println!("Location: {}", outcome.record.file_path.display());
            println!("Size: {}", format_size(outcome.record.size));
        }

        BackupCommands::List { limit } => {
            let records = engine.backups().get_backup_history(limit)?;
            println!("{}", format_backup_list(&records));
            if records.is_empty() {
                println!("Create one with: cmsbackup backup create");
            }
        }

        BackupCommands::Show { backup } => {
            let id = resolve_backup_id(engine, &backup)?;
            let record = engine.backups().get_backup_by_id(id)?;
            print!("{}", format_backup_details(&record));
        }

        BackupCommands::Delete { backup, force } => {
            let id = resolve_backup_id(engine, &backup)?;
            let record = engine.backups().get_backup_by_id(id)?;

            if !force {
                print!("{}", format_backup_details(&record));
                println!();
                println!("WARNING: This will permanently delete the archive file!");
                println!("To proceed, run again with --force flag:");
                println!("  cmsbackup backup delete {} --force", backup);
                return Ok(());
            }

            let outcome = engine.backups().delete_backup(id)?;
            println!("{}", outcome.message);
        }

        BackupCommands::Cleanup { days, force } => {
            let days = days.unwrap_or(engine.settings().retention_days);

            if !force {
                println!(
                    "This will delete all completed and failed backups older than {} day(s).",
                    days
                );
                println!("To proceed, run again with --force flag:");
                println!("  cmsbackup backup cleanup --days {} --force", days);
                return Ok(());
            }

            let outcome = engine.backups().cleanup_old_backups(days)?;
            println!("{}", outcome.message);
        }
    }

    Ok(())
}
