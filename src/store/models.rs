// catalogtool/src/store/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One column of a table's natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyField {
    pub column: &'static str,
    pub case_insensitive: bool,
}

impl KeyField {
    pub const fn exact(column: &'static str) -> Self {
        Self { column, case_insensitive: false }
    }

    pub const fn folded(column: &'static str) -> Self {
        Self { column, case_insensitive: true }
    }
}

/// A reference from a row to a parent entity that must already exist in the store.
///
/// When `assign_to` is set, the parent's `id` is written into that column of the
/// child record once resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRef {
    pub relation: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub value: String,
    pub case_insensitive: bool,
    pub assign_to: Option<&'static str>,
}

/// A mapped row ready for an upsert-skip insert.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub table: &'static str,
    pub key: &'static [KeyField],
    pub columns: Map<String, Value>,
    pub parents: Vec<ParentRef>,
}

impl EntityRecord {
    /// Renders the natural key as `col="value"` pairs for error messages.
    pub fn key_description(&self) -> String {
        self.key
            .iter()
            .map(|field| {
                let value = self
                    .columns
                    .get(field.column)
                    .map(display_value)
                    .unwrap_or_else(|| "null".to_string());
                format!("{}={:?}", field.column, truncate(&value, 60))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Plain string form of a scalar JSON value (strings unquoted).
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let cut: String = value.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// A row with the same key already existed; nothing was written.
    Skipped,
}

/// Full contents of one table as captured in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: String,
    pub rows: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportOperation {
    Import,
    Export,
    Backup,
}

impl std::fmt::Display for ExportOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportOperation::Import => write!(f, "import"),
            ExportOperation::Export => write!(f, "export"),
            ExportOperation::Backup => write!(f, "backup"),
        }
    }
}

impl std::str::FromStr for ExportOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" => Ok(ExportOperation::Import),
            "export" => Ok(ExportOperation::Export),
            "backup" => Ok(ExportOperation::Backup),
            _ => Err(format!("Invalid export operation: {}", s)),
        }
    }
}

/// Audit record of an import, export or backup attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportLogEntry {
    pub id: Uuid,
    pub operation: ExportOperation,
    pub format: String,
    pub data_type: String,
    pub status: String,
    pub actor: String,
    pub options: Value,
    pub record_count: i64,
    pub successful_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExportLogEntry {
    pub fn new(
        operation: ExportOperation,
        format: impl Into<String>,
        data_type: impl Into<String>,
        actor: impl Into<String>,
        options: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            operation,
            format: format.into(),
            data_type: data_type.into(),
            status: "started".to_string(),
            actor: actor.into(),
            options,
            record_count: 0,
            successful_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportCounts {
    pub record_count: i64,
    pub successful: i64,
    pub failed: i64,
}

/// Metadata for one point-in-time snapshot stored as a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub record_count: i64,
    pub file_key: Option<String>,
    pub size_bytes: i64,
    pub checksum: Option<String>,
    pub tables: Vec<String>,
    pub export_log_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupStats {
    pub count: i64,
    pub total_records: i64,
    pub total_size_bytes: i64,
    pub latest_created_at: Option<DateTime<Utc>>,
}
