// catalogtool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_JOB_RETENTION_HOURS: u64 = 24;
const DEFAULT_STUCK_TIMEOUT_MINUTES: u64 = 30;
const DEFAULT_BACKUP_KEY_PREFIX: &str = "backups";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonImportOptions {
    pub batch_size: Option<usize>,
    pub max_failure_ratio: Option<f64>,
    pub job_retention_hours: Option<u64>,
    pub stuck_timeout_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBackupOptions {
    pub tables: Option<Vec<String>>,
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub local_backup_dir: Option<PathBuf>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub import: Option<JsonImportOptions>,
    pub backup: Option<JsonBackupOptions>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub batch_size: usize,
    /// `None` means a job only fails when every record failed.
    pub max_failure_ratio: Option<f64>,
    pub job_retention: Duration,
    pub stuck_timeout: Duration,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_failure_ratio: None,
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_HOURS * 3600),
            stuck_timeout: Duration::from_secs(DEFAULT_STUCK_TIMEOUT_MINUTES * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub tables: Vec<String>,
    pub key_prefix: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            tables: vec!["quotes".to_string()],
            key_prefix: DEFAULT_BACKUP_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub local_backup_dir: Option<PathBuf>,
    pub spaces_config: Option<SpacesConfig>,
    pub import: ImportSettings,
    pub backup: BackupSettings,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, env::var("DATABASE_URL").ok())
    }

    /// Builds the validated configuration. A `database_url_override` (normally the
    /// `DATABASE_URL` environment variable) wins over the file value.
    pub fn from_raw(raw: RawJsonConfig, database_url_override: Option<String>) -> Result<Self> {
        let database_url = database_url_override
            .filter(|s| !s.trim().is_empty())
            .or_else(|| raw.database_url.clone().filter(|s| !s.trim().is_empty()))
            .context("database_url must be set in config.json or DATABASE_URL")?;

        let spaces_config = raw.s3_storage.as_ref().and_then(parse_spaces_config);

        if let Some(dir) = &raw.local_backup_dir {
            if dir.to_string_lossy().is_empty() {
                return Err(anyhow::anyhow!(
                    "local_backup_dir cannot be empty in config.json."
                ));
            }
        }

        Ok(AppConfig {
            database_url,
            local_backup_dir: raw.local_backup_dir.clone(),
            spaces_config,
            import: parse_import_settings(raw.import.as_ref())?,
            backup: parse_backup_settings(raw.backup.as_ref())?,
        })
    }
}

fn parse_spaces_config(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(SpacesConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
        })
    } else {
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            // Only warn if some S3 fields were provided but were incomplete/empty
            warn!("S3 configuration is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. Backups will use local storage.");
        }
        None
    }
}

fn parse_import_settings(raw: Option<&JsonImportOptions>) -> Result<ImportSettings> {
    let defaults = ImportSettings::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let batch_size = raw.batch_size.unwrap_or(defaults.batch_size);
    if batch_size == 0 {
        anyhow::bail!("import.batch_size must be greater than zero");
    }
    if let Some(ratio) = raw.max_failure_ratio {
        if !(0.0..=1.0).contains(&ratio) {
            anyhow::bail!("import.max_failure_ratio must be between 0.0 and 1.0, got {}", ratio);
        }
    }

    Ok(ImportSettings {
        batch_size,
        max_failure_ratio: raw.max_failure_ratio,
        job_retention: scaled_duration(raw.job_retention_hours, 3600, "import.job_retention_hours")?
            .unwrap_or(defaults.job_retention),
        stuck_timeout: scaled_duration(raw.stuck_timeout_minutes, 60, "import.stuck_timeout_minutes")?
            .unwrap_or(defaults.stuck_timeout),
    })
}

fn scaled_duration(value: Option<u64>, seconds_per_unit: u64, name: &str) -> Result<Option<Duration>> {
    value
        .map(|v| {
            v.checked_mul(seconds_per_unit)
                .map(Duration::from_secs)
                .ok_or_else(|| anyhow::anyhow!("{} is too large: {}", name, v))
        })
        .transpose()
}

fn parse_backup_settings(raw: Option<&JsonBackupOptions>) -> Result<BackupSettings> {
    let defaults = BackupSettings::default();
    let Some(raw) = raw else {
        return Ok(defaults);
    };

    let tables = match &raw.tables {
        Some(tables) => {
            if tables.is_empty() {
                anyhow::bail!("backup.tables cannot be empty when provided");
            }
            if tables.iter().any(|name| {
                name.trim().is_empty() || name.contains(|c: char| !c.is_alphanumeric() && c != '_')
            }) {
                anyhow::bail!("Invalid table name in backup.tables: {:?}", tables);
            }
            tables.clone()
        }
        None => defaults.tables,
    };

    Ok(BackupSettings {
        tables,
        key_prefix: raw
            .key_prefix
            .clone()
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.key_prefix),
    })
}
