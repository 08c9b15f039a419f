/*!
Petstash CLI - export, inspect and restore full petstash backups.

Reads the installation settings from `PETSTASH_*` environment variables;
the global flags override them.
*/

mod history;

use clap::{Parser, Subcommand};
use petstash_core::archive::decode_snapshot;
use petstash_core::{
    init_observability_with_filter, BackupService, BuildRequest, CompressionKind,
    ComponentCounts, PetstashConfig, PetstashError, RestoreEngine, RestoreLock, RestoreReport,
    Snapshot, SnapshotBuilder,
};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};

use crate::history::FileHistory;

#[derive(Parser)]
#[command(name = "petstash")]
#[command(about = "Backup and restore for the petstash dataset")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// SQLite database of the installation
    #[arg(long, global = true, env = "PETSTASH_DATABASE")]
    database: Option<PathBuf>,

    /// Root of the shared upload area
    #[arg(long, global = true, env = "PETSTASH_UPLOADS")]
    uploads: Option<PathBuf>,

    /// Installation table prefix
    #[arg(long, global = true, env = "PETSTASH_TABLE_PREFIX")]
    prefix: Option<String>,

    /// Directory holding backup archives and their history
    #[arg(long, global = true, env = "PETSTASH_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new backup archive
    Export {
        /// Collections to include (clients, pets, appointments, transactions)
        #[arg(short, long, value_delimiter = ',')]
        collections: Vec<String>,
        /// Output directory, defaults to the backup directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write plain JSON instead of gzip
        #[arg(long)]
        no_compress: bool,
    },
    /// Check that a backup file can be restored
    Validate {
        /// Backup file (.json or .json.gz)
        file: PathBuf,
    },
    /// Show what a backup file contains
    Inspect {
        /// Backup file (.json or .json.gz)
        file: PathBuf,
    },
    /// Show the live dataset counts
    Counts,
    /// List recorded backups
    List,
    /// Compare a recorded backup with its stored checksum
    Verify {
        /// Archive file name as listed by `petstash list`
        filename: String,
    },
    /// Replace the live dataset with a backup
    Restore {
        /// Backup file (.json or .json.gz)
        file: PathBuf,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "Component")]
    component: &'static str,
    #[tabled(rename = "Count")]
    count: usize,
}

#[derive(Tabled)]
struct BackupInfo {
    #[tabled(rename = "File")]
    filename: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Clients")]
    clients: usize,
    #[tabled(rename = "Pets")]
    pets: usize,
    #[tabled(rename = "Files")]
    files: usize,
    #[tabled(rename = "Size")]
    size: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "petstash=debug"
    } else {
        petstash_core::observability::DEFAULT_LOG_FILTER
    };
    init_observability_with_filter(cli.json_logs, default_filter)?;

    let config = create_config(&cli)?;

    match cli.command {
        Commands::Export {
            collections,
            output,
            no_compress,
        } => export_backup(config, &collections, output, no_compress).await?,
        Commands::Validate { file } => validate_backup(&file).await?,
        Commands::Inspect { file } => inspect_backup(&file).await?,
        Commands::Counts => show_counts(&config).await?,
        Commands::List => list_backups(&config).await?,
        Commands::Verify { filename } => verify_backup(&config, &filename).await?,
        Commands::Restore { file, force } => restore_backup(&config, &file, force).await?,
    }

    Ok(())
}

fn create_config(cli: &Cli) -> Result<PetstashConfig, anyhow::Error> {
    let mut config = PetstashConfig::from_env()?;

    if let Some(path) = &cli.database {
        config.database_path = path.clone();
    }
    if let Some(path) = &cli.uploads {
        config.upload_root = path.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.table_prefix = prefix.clone();
    }
    if let Some(path) = &cli.backup_dir {
        config.backup_dir = path.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn export_backup(
    mut config: PetstashConfig,
    collections: &[String],
    output: Option<PathBuf>,
    no_compress: bool,
) -> Result<(), anyhow::Error> {
    if let Some(dir) = output {
        config.backup_dir = dir;
    }
    if no_compress {
        config.compression = CompressionKind::None;
    }

    let request = if collections.is_empty() {
        BuildRequest::all()
    } else {
        BuildRequest::from_names(collections)
    };
    info!("Exporting {}", request.names().join(", "));

    let store = config.open_store()?;
    let uploads = config.uploads();
    let archive = config.archive();
    let history = FileHistory::new(&config.backup_dir);

    let record = BackupService::new(&store, &uploads, &archive, &history).create_backup(&request)?;

    println!("✓ Backup written: {}", config.backup_dir.join(&record.filename).display());
    println!("  Size: {}", format_size(record.size_bytes));
    if let Some(checksum) = &record.stats.checksum {
        println!("  Checksum: {checksum}");
    }
    print_counts(&record.stats.counts);
    Ok(())
}

async fn validate_backup(file: &Path) -> Result<(), anyhow::Error> {
    info!("Validating backup: {}", file.display());

    match read_snapshot(file) {
        Ok(snapshot) => {
            println!(
                "✓ Backup is valid (schema version {}, generated {})",
                snapshot.schema_version,
                snapshot.generated_at.format("%Y-%m-%d %H:%M:%S")
            );
            Ok(())
        }
        Err(PetstashError::Validation(reason)) => {
            error!("✗ Backup rejected: {}", reason);
            Err(anyhow::anyhow!("Invalid backup: {reason}"))
        }
        Err(e) => {
            error!("✗ Failed to read backup: {}", e);
            Err(e.into())
        }
    }
}

async fn inspect_backup(file: &Path) -> Result<(), anyhow::Error> {
    let snapshot = read_snapshot(file)?;

    println!("Backup Details:");
    println!("  File: {}", file.display());
    println!("  Plugin: {}", snapshot.plugin);
    println!("  Schema Version: {}", snapshot.schema_version);
    println!(
        "  Generated: {}",
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    print_counts(&ComponentCounts::of(&snapshot));

    if !snapshot.tables.is_empty() {
        println!("Tables:");
        for table in &snapshot.tables {
            println!("  {} ({} rows)", table.name, table.rows.len());
        }
    }
    Ok(())
}

async fn show_counts(config: &PetstashConfig) -> Result<(), anyhow::Error> {
    let store = config.open_store()?;
    let uploads = config.uploads();
    let counts = SnapshotBuilder::new(&store, &uploads).live_counts()?;
    print_counts(&counts);
    Ok(())
}

async fn list_backups(config: &PetstashConfig) -> Result<(), anyhow::Error> {
    let history = FileHistory::new(&config.backup_dir);
    let mut backups: Vec<BackupInfo> = history
        .records()?
        .into_iter()
        .map(|record| BackupInfo {
            created: record
                .stats
                .generated_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            clients: record.stats.counts.clients,
            pets: record.stats.counts.pets,
            files: record.stats.counts.files,
            size: format_size(record.size_bytes),
            filename: record.filename,
        })
        .collect();

    if backups.is_empty() {
        println!("No backups found in {}", config.backup_dir.display());
    } else {
        backups.sort_by(|a, b| a.created.cmp(&b.created));
        println!("{}", Table::new(backups));
    }
    Ok(())
}

async fn verify_backup(config: &PetstashConfig, filename: &str) -> Result<(), anyhow::Error> {
    info!("Verifying backup: {}", filename);

    let record = FileHistory::new(&config.backup_dir)
        .find(filename)?
        .ok_or_else(|| anyhow::anyhow!("No backup named '{filename}' in history"))?;
    let expected = record
        .stats
        .checksum
        .ok_or_else(|| anyhow::anyhow!("No checksum recorded for '{filename}'"))?;

    match config.archive().verify(filename, &expected) {
        Ok(()) => {
            println!("✓ Backup integrity check passed");
            Ok(())
        }
        Err(PetstashError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            Err(anyhow::anyhow!("Integrity check failed"))
        }
        Err(e) => {
            error!("✗ Failed to verify backup: {}", e);
            Err(e.into())
        }
    }
}

async fn restore_backup(
    config: &PetstashConfig,
    file: &Path,
    force: bool,
) -> Result<(), anyhow::Error> {
    let snapshot = read_snapshot(file)?;
    print_counts(&ComponentCounts::of(&snapshot));

    if !force {
        print!(
            "This replaces every client, pet, appointment, transaction and petstash file in {}. Continue? (y/N): ",
            config.database_path.display()
        );
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Restore cancelled");
            return Ok(());
        }
    }

    let store = config.open_store()?;
    let uploads = config.uploads();
    let lock = RestoreLock::acquire(&config.upload_root)?;

    let report = match RestoreEngine::new(&store, &uploads).restore(&snapshot, &lock) {
        Ok(report) => report,
        Err(e) => {
            error!("✗ Restore failed, nothing was changed: {}", e);
            return Err(e.into());
        }
    };

    print_report(&report);
    Ok(())
}

fn read_snapshot(file: &Path) -> Result<Snapshot, PetstashError> {
    let bytes = std::fs::read(file)?;
    decode_snapshot(&bytes)
}

fn print_counts(counts: &ComponentCounts) {
    let rows: Vec<CountRow> = counts
        .entries()
        .into_iter()
        .map(|(component, count)| CountRow { component, count })
        .collect();
    println!("{}", Table::new(rows));
}

fn print_report(report: &RestoreReport) {
    println!("✓ Restore committed");
    print_counts(&ComponentCounts {
        clients: report.clients,
        pets: report.pets,
        appointments: report.appointments,
        transactions: report.transactions,
        tables: report.tables,
        files: report.files,
    });

    if report.unresolved_references > 0 {
        println!(
            "  {} references pointed at records missing from the backup",
            report.unresolved_references
        );
    }
    for table in &report.skipped_tables {
        println!("  Skipped table not owned by petstash: {table}");
    }
    for warning in &report.warnings {
        println!("  ! {warning}");
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
