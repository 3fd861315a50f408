//! Bulk import pipeline: payload decoding, validation, per-entity upserts,
//! progress tracking, cancellation and background execution.

pub mod coordinator;
pub mod entities;
pub mod importer;
pub mod payload;
pub mod progress;
pub mod scheduler;
pub mod unresolved;
pub mod validator;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use coordinator::{ImportCoordinator, ImportHandle, MaintenanceReport};
pub use entities::EntityKind;
pub use progress::{
    ImportJob, InMemoryProgressRepository, JobStats, JobStatus, ProgressError, ProgressHandle,
    ProgressRepository, ProgressUpdate,
};
pub use scheduler::BackgroundScheduler;
pub use unresolved::{InMemoryUnresolvedRowStore, UnresolvedExport, UnresolvedRowStore};
pub use validator::{ValidationPreview, ValidationResult};

/// Unique import job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a payload contains: rows of one entity kind, or a full multi-kind dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Entity(EntityKind),
    Full,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Entity(kind) => write!(f, "{}", kind),
            DataType::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" | "all" => Ok(DataType::Full),
            other => other.parse().map(DataType::Entity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    #[default]
    Json,
    Csv,
}

impl std::fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportFormat::Json => write!(f, "json"),
            ImportFormat::Csv => write!(f, "csv"),
        }
    }
}

impl std::str::FromStr for ImportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ImportFormat::Json),
            "csv" => Ok(ImportFormat::Csv),
            _ => Err(format!("Invalid import format: {}. Must be 'json' or 'csv'", s)),
        }
    }
}

/// Per-request overrides of the configured import settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub batch_size: Option<usize>,
    pub max_failure_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportPayload {
    /// Already-parsed JSON (single object, array, or kind → rows map).
    Json(Value),
    /// Raw file contents, decoded according to the request's format.
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub data_type: DataType,
    pub payload: ImportPayload,
    pub format: ImportFormat,
    pub options: ImportOptions,
    pub filename: Option<String>,
}

impl ImportRequest {
    pub fn json(data_type: DataType, payload: Value) -> Self {
        Self {
            data_type,
            payload: ImportPayload::Json(payload),
            format: ImportFormat::Json,
            options: ImportOptions::default(),
            filename: None,
        }
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}
