use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use cms_backup::cli::{handle_backup_command, handle_restore_command};
use cms_backup::config::{BackupPaths, Settings};
use cms_backup::logging::init_logger;
use cms_backup::storage::JsonDirStore;
use cms_backup::Engine;

#[derive(Parser)]
#[command(
    name = "cmsbackup",
    author = "Kaylee Beyene",
    version,
    about = "Snapshot backup and restore for the CMS document store",
    long_about = "cmsbackup writes whitelisted CMS collections into compressed, \
                  optionally encrypted archives and restores them in overwrite \
                  or merge mode, keeping a history of every operation."
)]
struct Cli {
    /// Directory of the document store (defaults to <base>/data)
    #[arg(long, global = true, env = "CMS_BACKUP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backup management commands
    #[command(subcommand)]
    Backup(cms_backup::cli::BackupCommands),

    /// Restore commands
    #[command(subcommand)]
    Restore(cms_backup::cli::RestoreCommands),

    /// Show current configuration and paths
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    // Initialize paths and settings
    let paths = BackupPaths::new()?;
    let settings = Settings::load_or_create(&paths)?;

    let data_dir = cli.data_dir.unwrap_or_else(|| paths.data_dir());

    match cli.command {
        Some(Commands::Backup(cmd)) => {
            let engine = open_engine(paths, settings, data_dir)?;
            handle_backup_command(&engine, cmd)?;
        }
        Some(Commands::Restore(cmd)) => {
            let engine = open_engine(paths, settings, data_dir)?;
            handle_restore_command(&engine, cmd)?;
        }
        Some(Commands::Config) => {
            println!("cmsbackup Configuration");
            println!("=======================");
            println!("Base directory:   {}", paths.base_dir().display());
            println!("Data directory:   {}", data_dir.display());
            println!("Backup directory: {}", paths.backup_dir().display());
            println!("History:          {}", paths.history_dir().display());
            println!();
            println!("Settings:");
            println!("  Retention days:        {}", settings.retention_days);
            println!("  Lock TTL (s):          {}", settings.lock_ttl_secs);
            println!("  Compress by default:   {}", settings.compress_by_default);
            println!("  Dump workers:          {}", settings.dump_workers());
            println!("  Restore batch size:    {}", settings.batch_size());
            println!(
                "  Safety backup:         {}",
                settings.safety_backup_before_overwrite
            );
        }
        None => {
            println!("cmsbackup - Snapshot backup and restore for the CMS document store");
            println!();
            println!("Run 'cmsbackup --help' for usage information.");
        }
    }

    Ok(())
}

fn open_engine(paths: BackupPaths, settings: Settings, data_dir: PathBuf) -> Result<Engine> {
    let store = Arc::new(JsonDirStore::new(data_dir));
    Ok(Engine::open(paths, settings, store)?)
}
