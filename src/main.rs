//! Catalogue import and backup tool
//!
//! Provides a CLI over the bulk import pipeline and the backup/restore manager

// catalogtool/src/main.rs
use anyhow::{Context, Result};
use catalogtool::backup::BackupManager;
use catalogtool::config::AppConfig;
use catalogtool::import::{
    validator, DataType, EntityKind, ImportCoordinator, ImportFormat, ImportOptions,
    ImportPayload, ImportRequest, InMemoryProgressRepository, InMemoryUnresolvedRowStore,
    JobStatus,
};
use catalogtool::store::PgStore;
use catalogtool::utils::{logging, setting};
use catalogtool::storage;
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

const ACTOR: &str = "cli";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Main entry point for the import/backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    logging::init("info");

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        args = prompt_command()?;
    }
    let Some((command, rest)) = args.split_first() else {
        anyhow::bail!("No command given");
    };

    // Validation needs no database.
    if command == "validate" {
        return validate_file(rest);
    }

    if !setting::check_db_connection(&app_config.database_url).await {
        anyhow::bail!("Database is not reachable");
    }
    let pg = Arc::new(
        PgStore::connect(&app_config.database_url)
            .await
            .context("Failed to connect to the catalogue database")?,
    );
    pg.ensure_metadata_schema()
        .await
        .context("Failed to prepare metadata tables")?;

    match command.as_str() {
        "import" => run_import(&app_config, pg, rest).await,
        other => {
            let blobs = storage::from_config(&app_config).await;
            info!("Snapshots stored in {}", blobs.describe());
            let manager = BackupManager::new(pg.clone(), pg, blobs, app_config.backup.clone());
            run_backup_command(&manager, other, rest).await
        }
    }
}

async fn run_import(app_config: &AppConfig, pg: Arc<PgStore>, args: &[String]) -> Result<()> {
    let [data_type, file, format @ ..] = args else {
        anyhow::bail!("Usage: import <data_type> <file> [json|csv]");
    };
    let data_type: DataType = data_type.parse().map_err(anyhow::Error::msg)?;
    let path = Path::new(file);
    let format = match format.first() {
        Some(f) => f.parse().map_err(anyhow::Error::msg)?,
        None => format_from_extension(path),
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file {}", path.display()))?;
    let payload = match format {
        ImportFormat::Json => ImportPayload::Json(
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON from {}", path.display()))?,
        ),
        ImportFormat::Csv => ImportPayload::Text(contents),
    };

    let request = ImportRequest {
        data_type,
        payload,
        format,
        options: ImportOptions::default(),
        filename: path.file_name().map(|n| n.to_string_lossy().into_owned()),
    };

    println!("🚀 Starting import of {} from {}...", data_type, path.display());
    let coordinator = Arc::new(ImportCoordinator::new(
        pg.clone(),
        pg,
        InMemoryProgressRepository::arc(),
        Arc::new(InMemoryUnresolvedRowStore::new()),
        app_config.import.clone(),
    ));
    let handle = coordinator.start_import(request, ACTOR).await?;

    let maintenance = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = coordinator.run_maintenance().await;
                if !report.stuck.is_empty() {
                    warn!(stuck = ?report.stuck, "Stuck import jobs were failed");
                }
            }
        })
    };
    coordinator.drain().await;
    maintenance.abort();

    let job = coordinator.progress(handle.job_id).await?;
    print_json(&job)?;

    let unresolved = coordinator.export_unresolved(handle.job_id).await?;
    if unresolved.total_rows > 0 {
        let out = PathBuf::from(format!("unresolved_{}.json", handle.job_id));
        std::fs::write(&out, serde_json::to_vec_pretty(&unresolved)?)
            .with_context(|| format!("Failed to write unresolved rows to {}", out.display()))?;
        println!("⚠️ {} unresolved rows written to {}", unresolved.total_rows, out.display());
        coordinator.clear_unresolved(handle.job_id).await?;
    }

    if job.status != JobStatus::Completed {
        anyhow::bail!("Import finished with status {}", job.status.as_str());
    }
    Ok(())
}

fn validate_file(args: &[String]) -> Result<()> {
    let [kind, file] = args else {
        anyhow::bail!("Usage: validate <kind> <file>");
    };
    let kind: EntityKind = kind.parse().map_err(anyhow::Error::msg)?;
    let contents = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file))?;
    let data = serde_json::from_str(&contents).with_context(|| format!("Failed to parse JSON from {}", file))?;

    let preview = validator::validate_only(kind, &data);
    print_json(&preview)?;
    if !preview.result.is_valid {
        anyhow::bail!("{} records failed validation", preview.result.invalid_records.len());
    }
    Ok(())
}

async fn run_backup_command(manager: &BackupManager, command: &str, args: &[String]) -> Result<()> {
    match command {
        "backup" => {
            println!("🚀 Starting Backup Process...");
            let description = args.join(" ");
            let record = manager.create_backup(&description, ACTOR).await.context("Backup process failed")?;
            print_json(&record)?;
        }
        "list" => {
            let limit = parse_arg(args.first(), DEFAULT_LIST_LIMIT)?;
            let offset = parse_arg(args.get(1), 0)?;
            print_json(&manager.list_backups(limit, offset).await?)?;
        }
        "stats" => {
            let listing = manager.list_backups(1, 0).await?;
            print_json(&listing.stats)?;
        }
        "verify" => {
            let id = parse_id(args.first())?;
            let report = manager.verify_backup(id).await?;
            print_json(&report)?;
            if !report.is_verified() {
                anyhow::bail!("Backup {} did not verify", id);
            }
        }
        "restore" => {
            println!("🔄 Starting Restore Process...");
            let id = parse_id(args.first())?;
            let confirmed = args.iter().skip(1).any(|a| a == "--confirm");
            let summary = manager
                .restore_from_backup(id, confirmed)
                .await
                .context("Restore process failed")?;
            print_json(&summary)?;
        }
        "delete" => {
            if args.is_empty() {
                anyhow::bail!("Usage: delete <id>...");
            }
            let ids = args.iter().map(|a| parse_id(Some(a))).collect::<Result<Vec<Uuid>>>()?;
            let result = manager.bulk_delete(&ids).await;
            print_json(&result)?;
            if result.failed > 0 {
                anyhow::bail!("{} of {} deletions failed", result.failed, result.total);
            }
        }
        _ => {
            println!("❌ Invalid command. Use import, validate, backup, list, stats, verify, restore or delete.");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

fn format_from_extension(path: &Path) -> ImportFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => ImportFormat::Csv,
        _ => ImportFormat::Json,
    }
}

fn parse_id(arg: Option<&String>) -> Result<Uuid> {
    let raw = arg.context("A backup id is required")?;
    Uuid::parse_str(raw).with_context(|| format!("Invalid backup id: {}", raw))
}

fn parse_arg(arg: Option<&String>, default: i64) -> Result<i64> {
    match arg {
        Some(raw) => raw.parse().with_context(|| format!("Invalid number: {}", raw)),
        None => Ok(default),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to render output")?);
    Ok(())
}

/// Prompts for a command line when none was passed
fn prompt_command() -> Result<Vec<String>> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("  import <data_type> <file> [json|csv]");
    println!("  validate <kind> <file>");
    println!("  backup <description>");
    println!("  list [limit] [offset]");
    println!("  stats");
    println!("  verify <id>");
    println!("  restore <id> --confirm");
    println!("  delete <id>...");
    print!("Enter command: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.split_whitespace().map(str::to_string).collect())
}
