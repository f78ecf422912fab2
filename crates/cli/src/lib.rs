use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use markup_core::{
    AnnotationPersistence, BackendConfig, BackupConfig, ExportFormat, PersistenceConfig, SessionId,
};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Parser)]
#[command(name = "markup-cli")]
#[command(about = "Inspect and maintain stored annotation sessions")]
pub struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Engine configuration file (JSON).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Use a directory store instead of the configured backend.
    #[arg(long, global = true, value_name = "DIR", conflicts_with = "journal")]
    store_dir: Option<PathBuf>,

    /// Use a journaled database file instead of the configured backend.
    #[arg(long, global = true, value_name = "FILE")]
    journal: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List session summaries as JSON.
    Sessions,
    /// Print a whole session as JSON.
    Show {
        #[arg(value_name = "ID")]
        id: SessionId,
    },
    /// Delete a session (a pre-delete backup is written first).
    Delete {
        #[arg(value_name = "ID")]
        id: SessionId,
    },
    /// Export a session.
    Export {
        #[arg(value_name = "ID")]
        id: SessionId,
        #[arg(long, default_value_t = ExportFormat::Json)]
        format: ExportFormat,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a session document into a new session.
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Defaults to the file extension, or json.
        #[arg(long)]
        format: Option<ExportFormat>,
    },
    /// Manage backups.
    Backup {
        #[command(subcommand)]
        action: BackupCommand,
    },
    /// Delete sessions not updated within the retention period.
    Sweep {
        #[arg(long, value_name = "N")]
        retention_days: Option<u64>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Snapshot every session.
    Create,
    /// List backups, newest first.
    List,
    /// Replace the stored sessions with a backup.
    Restore {
        #[arg(value_name = "ID")]
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct ImportOutput {
    session_id: SessionId,
    imported: usize,
    skipped: usize,
}

#[derive(Debug, Serialize)]
struct SweepOutput {
    deleted: Vec<SessionId>,
    failed: Vec<SessionId>,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    match cli.command {
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Sessions => print_json(&open_engine(&cli.store)?.list_sessions()),
        Commands::Show { id } => {
            let engine = open_engine(&cli.store)?;
            let session = engine.get_session(id).with_context(|| format!("session not found: {id}"))?;
            print_json(&session)
        }
        Commands::Delete { id } => run_delete(&open_engine(&cli.store)?, id),
        Commands::Export { id, format, output } => {
            run_export(&open_engine(&cli.store)?, id, format, output.as_deref())
        }
        Commands::Import { file, format } => run_import(&open_engine(&cli.store)?, &file, format),
        Commands::Backup { action } => run_backup(&open_engine(&cli.store)?, action),
        Commands::Sweep { retention_days } => run_sweep(&cli.store, retention_days),
    }
}

fn load_config(args: &StoreArgs) -> Result<PersistenceConfig> {
    let mut config = match &args.config {
        Some(path) => PersistenceConfig::load(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => PersistenceConfig::default(),
    };

    if let Some(dir) = &args.store_dir {
        config.backend = BackendConfig::Local { root: Some(dir.clone()), quota_bytes: None };
    } else if let Some(path) = &args.journal {
        config.backend = BackendConfig::Journal { path: Some(path.clone()) };
    }

    // One-shot commands write synchronously and never arm the backup timer
    let backup = BackupConfig { enabled: false, ..config.backup.clone() };
    Ok(config.with_auto_save(false).with_backup(backup))
}

fn open_engine(args: &StoreArgs) -> Result<AnnotationPersistence> {
    engine_for(load_config(args)?)
}

fn engine_for(config: PersistenceConfig) -> Result<AnnotationPersistence> {
    let kind = config.backend.kind();
    let backend = markup_storage::try_open_backend(&config.backend)
        .with_context(|| format!("failed to open {kind:?} store"))?;
    log::debug!("opened {kind:?} store");
    Ok(AnnotationPersistence::with_backend(config, backend))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{json}");
    Ok(())
}

fn run_delete(engine: &AnnotationPersistence, id: SessionId) -> Result<()> {
    if engine.get_session(id).is_none() {
        anyhow::bail!("session not found: {id}");
    }
    if !engine.delete_session(id) {
        anyhow::bail!("failed to delete session {id}");
    }
    println!("deleted {id}");
    Ok(())
}

fn run_export(
    engine: &AnnotationPersistence,
    id: SessionId,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let document = engine.export_session(id, format).context("failed to export session")?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, document)
                .with_context(|| format!("failed to write export to {}", path.display()))?;
            println!("{}", path.display());
        }
        None => print!("{document}"),
    }
    Ok(())
}

fn format_for(file: &Path) -> ExportFormat {
    match file.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => ExportFormat::Csv,
        _ => ExportFormat::Json,
    }
}

fn run_import(engine: &AnnotationPersistence, file: &Path, format: Option<ExportFormat>) -> Result<()> {
    let data = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let format = format.unwrap_or_else(|| format_for(file));

    let report = engine.import_session(&data, format).context("failed to import session")?;
    if !report.durable {
        anyhow::bail!("imported session {} could not be written", report.session_id);
    }
    print_json(&ImportOutput {
        session_id: report.session_id,
        imported: report.imported,
        skipped: report.skipped,
    })
}

fn run_backup(engine: &AnnotationPersistence, action: BackupCommand) -> Result<()> {
    match action {
        BackupCommand::Create => {
            let id = engine.create_backup().context("failed to write backup")?;
            println!("{id}");
            Ok(())
        }
        BackupCommand::List => print_json(&engine.list_backup_info()),
        BackupCommand::Restore { id } => {
            if engine.load_backup(&id).is_none() {
                anyhow::bail!("backup not found: {id}");
            }
            if !engine.restore_backup(&id) {
                anyhow::bail!("backup {id} was only partially restored");
            }
            println!("restored {id}");
            Ok(())
        }
    }
}

/// Huge day counts saturate instead of overflowing
fn retention_period(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(DAY_SECS))
}

fn run_sweep(args: &StoreArgs, retention_days: Option<u64>) -> Result<()> {
    let mut config = load_config(args)?;
    if let Some(days) = retention_days {
        config = config.with_retention_period(retention_period(days));
    }

    let report = engine_for(config)?.sweep_expired_sessions();
    print_json(&SweepOutput { deleted: report.deleted, failed: report.failed })
}
