//! Restore CLI commands

use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use super::{passphrase, resolve_backup_id, split_collections};
use crate::archive::ArchiveReader;
use crate::backup::{PreviewRequest, RestoreRequest};
use crate::display::{format_preview, format_restore_details, format_restore_list};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::RestoreSource;

/// Where to read the archive from
#[derive(Args, Debug)]
pub struct SourceArgs {
    /// Backup id (use 'latest' for most recent)
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub backup: Option<String>,

    /// Restore from an archive file instead of a recorded backup
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Collections to restore (comma separated)
    #[arg(short, long, value_delimiter = ',')]
    pub collections: Vec<String>,
}

/// Restore subcommands
#[derive(Subcommand)]
pub enum RestoreCommands {
    /// Restore collections from an archive
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Merge into existing collections instead of replacing them
        #[arg(long)]
        merge: bool,

        /// Do not take a safety backup before overwriting
        #[arg(long)]
        no_safety_backup: bool,

        /// Free-form description
        #[arg(short, long)]
        description: Option<String>,

        /// Who is running the restore
        #[arg(long = "by", env = "CMS_BACKUP_USER", default_value = "admin")]
        restored_by: String,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Show what a restore would change
    Preview {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// List recent restores
    History {
        /// Number of restores to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Show details of a restore
    Show {
        /// Restore id
        restore: String,
    },

    /// Delete restore records older than the retention period
    Cleanup {
        /// Retention period in days (defaults to the configured value)
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Handle a restore command
pub fn handle_restore_command(engine: &Engine, cmd: RestoreCommands) -> EngineResult<()> {
    match cmd {
        RestoreCommands::Run {
            source,
            merge,
            no_safety_backup,
            description,
            restored_by,
            timeout,
            force,
        } => {
            let collections = split_collections(&source.collections);
            let target = resolve_source(engine, &source)?;

            if !force {
                let mode = if merge { "merged into" } else { "REPLACE" };
                println!(
                    "WARNING: Archived collections will {} the current data!",
                    mode
                );
                println!("Preview the changes with: cmsbackup restore preview");
                println!("To proceed, run again with --force flag.");
                return Ok(());
            }

            let mut request = RestoreRequest::new(target.clone(), restored_by).overwrite(!merge);
            if let Some(names) = collections {
                request = request.with_collections(names);
            }
            if no_safety_backup {
                request.safety_backup = Some(false);
            }
            request.description = description;
            request.timeout = timeout.map(Duration::from_secs);
            if needs_passphrase(engine, &target)? {
                request.passphrase = Some(passphrase::existing_passphrase()?);
            }

            println!("Restoring...");
            let outcome = engine.restores().restore_from_backup(request)?;
            if let Some(safety) = outcome.safety_backup_id {
                println!("Safety backup: {}", safety);
            }
            println!("{}", outcome.message);
            println!("Restore ID: {}", outcome.restore_id);
        }

        RestoreCommands::Preview { source } => {
            let collections = split_collections(&source.collections);
            let target = resolve_source(engine, &source)?;

            let mut request = PreviewRequest::new(target.clone());
            if let Some(names) = collections {
                request = request.with_collections(names);
            }
            if needs_passphrase(engine, &target)? {
                request.passphrase = Some(passphrase::existing_passphrase()?);
            }

            let preview = engine.restores().get_restore_preview(request)?;
            print!("{}", format_preview(&preview));
        }

        RestoreCommands::History { limit } => {
            let records = engine.restores().get_restore_history(limit)?;
            println!("{}", format_restore_list(&records));
        }

        RestoreCommands::Show { restore } => {
            let id = restore
                .parse()
                .map_err(|_| EngineError::Validation(format!("'{}' is not a restore id", restore)))?;
            let record = engine.restores().get_restore_by_id(id)?;
            print!("{}", format_restore_details(&record));
        }

        RestoreCommands::Cleanup { days } => {
            let days = days.unwrap_or(engine.settings().retention_days);
            let outcome = engine.restores().cleanup_old_restores(days)?;
            println!("{}", outcome.message);
        }
    }

    Ok(())
}

fn resolve_source(engine: &Engine, args: &SourceArgs) -> EngineResult<RestoreSource> {
    match (&args.backup, &args.file) {
        (_, Some(path)) => Ok(RestoreSource::UploadedFile { path: path.clone() }),
        (Some(backup), None) => Ok(RestoreSource::ExistingBackup(resolve_backup_id(
            engine, backup,
        )?)),
        (None, None) => Err(EngineError::Validation(
            "Either a backup id or --file is required".into(),
        )),
    }
}

/// Whether the archive behind `source` is encrypted
fn needs_passphrase(engine: &Engine, source: &RestoreSource) -> EngineResult<bool> {
    match source {
        RestoreSource::ExistingBackup(id) => {
            Ok(engine.backups().get_backup_by_id(*id)?.encryption)
        }
        RestoreSource::UploadedFile { path } => match ArchiveReader::open(path, None) {
            Ok(_) => Ok(false),
            Err(EngineError::Encryption(_)) => Ok(true),
            // Let the restore itself report the problem
            Err(_) => Ok(false),
        },
    }
}
