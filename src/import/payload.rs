// catalogtool/src/import/payload.rs
use serde_json::{Map, Value};

use super::entities::EntityKind;
use super::{DataType, ImportFormat, ImportPayload};
use crate::errors::{AppError, Result};

/// Rows of one entity kind, in submission order.
pub type EntityRows = (EntityKind, Vec<Value>);

/// Decodes a request payload into per-kind row groups in dependency order.
/// Malformed payloads are rejected before a job is created.
pub fn decode(data_type: DataType, format: ImportFormat, payload: &ImportPayload) -> Result<Vec<EntityRows>> {
    match format {
        ImportFormat::Json => {
            let value = match payload {
                ImportPayload::Json(value) => value.clone(),
                ImportPayload::Text(text) => serde_json::from_str(text)
                    .map_err(|e| AppError::Validation(format!("payload is not valid JSON: {}", e)))?,
            };
            decode_json(data_type, value)
        }
        ImportFormat::Csv => {
            let DataType::Entity(kind) = data_type else {
                return Err(AppError::Validation(
                    "CSV imports require a single entity kind".to_string(),
                ));
            };
            let ImportPayload::Text(text) = payload else {
                return Err(AppError::Validation(
                    "CSV imports require the raw file contents".to_string(),
                ));
            };
            Ok(vec![(kind, parse_csv(text)?)])
        }
    }
}

fn decode_json(data_type: DataType, value: Value) -> Result<Vec<EntityRows>> {
    match data_type {
        DataType::Entity(kind) => Ok(vec![(kind, into_rows(value, kind.as_str())?)]),
        DataType::Full => {
            let Value::Object(groups) = value else {
                return Err(AppError::Validation(
                    "a full import must be an object mapping entity kinds to rows".to_string(),
                ));
            };
            let mut decoded = Vec::new();
            for (name, rows) in groups {
                let kind: EntityKind = name.parse().map_err(AppError::Validation)?;
                if decoded.iter().any(|(k, _)| *k == kind) {
                    return Err(AppError::Validation(format!(
                        "entity kind '{}' appears more than once",
                        kind
                    )));
                }
                decoded.push((kind, into_rows(rows, &name)?));
            }
            decoded.sort_by_key(|(kind, _)| kind_position(*kind));
            decoded.retain(|(_, rows)| !rows.is_empty());
            Ok(decoded)
        }
    }
}

/// A single record is accepted and treated as a one-element sequence.
fn into_rows(value: Value, label: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(rows) => Ok(rows),
        Value::Object(_) => Ok(vec![value]),
        Value::Null => Ok(Vec::new()),
        other => Err(AppError::Validation(format!(
            "{}: expected an object or an array of objects, got {}",
            label,
            json_type(&other)
        ))),
    }
}

fn kind_position(kind: EntityKind) -> usize {
    EntityKind::ORDERED
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(EntityKind::ORDERED.len())
}

/// Header row required; cells are trimmed and empty cells become absent fields.
pub fn parse_csv(text: &str) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| AppError::Validation(format!("invalid CSV header: {}", e)))?
        .clone();
    if headers.iter().all(str::is_empty) {
        return Err(AppError::Validation("CSV payload has no header row".to_string()));
    }

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| AppError::Validation(format!("invalid CSV at record {}: {}", index, e)))?;
        let mut row = Map::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            if header.is_empty() || cell.is_empty() {
                continue;
            }
            row.insert(header.to_string(), Value::String(cell.to_string()));
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
