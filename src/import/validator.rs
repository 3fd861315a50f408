// catalogtool/src/import/validator.rs
//! Stateless schema and cross-record checks.
//!
//! A bad record only ever adds messages; it never stops the remaining records
//! from being checked. Natural-key collisions are warnings, not errors.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::entities::{EntityKind, FieldType};
use super::payload::json_type;
use crate::store::models::display_value;

const PREVIEW_LEN: usize = 5;

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$";

static EMAIL_REGEX: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(EMAIL_PATTERN));

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub error_count: usize,
    pub warning_count: usize,
    /// Indices of records with at least one error.
    pub invalid_records: Vec<usize>,
}

impl ValidationResult {
    pub fn is_record_valid(&self, index: usize) -> bool {
        self.invalid_records.binary_search(&index).is_err()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationPreview {
    #[serde(flatten)]
    pub result: ValidationResult,
    pub preview: Vec<Value>,
}

/// Validates a single record or a sequence of records, as submitted.
pub fn validate(kind: EntityKind, raw: &Value) -> ValidationResult {
    let records = normalize_all(kind, raw);
    validate_records(kind, &records, 0)
}

/// Dry run for operators: the validation result plus the first normalized records.
pub fn validate_only(kind: EntityKind, raw: &Value) -> ValidationPreview {
    let records = normalize_all(kind, raw);
    let result = validate_records(kind, &records, 0);
    ValidationPreview {
        result,
        preview: records.into_iter().take(PREVIEW_LEN).collect(),
    }
}

fn normalize_all(kind: EntityKind, raw: &Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items.iter().map(|item| kind.normalize(item)).collect(),
        single => vec![kind.normalize(single)],
    }
}

/// Validates already-normalized records. Messages use `offset + position` as the
/// record index so batches report positions within the whole submission.
pub fn validate_records(kind: EntityKind, records: &[Value], offset: usize) -> ValidationResult {
    let mut result = check_schema(kind, records, offset);
    let duplicates = find_duplicates(kind, records, offset, &result.invalid_records);
    result.warning_count += duplicates.len();
    result.warnings.extend(duplicates);
    result
}

/// Per-record checks only, without the cross-record duplicate pass. Used per
/// batch during an import, where duplicates are checked once over all rows of
/// the kind instead.
pub fn check_schema(kind: EntityKind, records: &[Value], offset: usize) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut invalid_records = Vec::new();

    for (position, record) in records.iter().enumerate() {
        let index = offset + position;
        let before = errors.len();
        match record {
            Value::Object(map) => check_record(kind, index, map, &mut errors, &mut warnings),
            other => errors.push(format!(
                "record {}: expected an object, got {}",
                index,
                json_type(other)
            )),
        }
        if errors.len() > before {
            invalid_records.push(index);
        }
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        error_count: errors.len(),
        warning_count: warnings.len(),
        errors,
        warnings,
        invalid_records,
    }
}

/// Natural-key collisions among the valid records of one kind.
pub fn duplicate_warnings(kind: EntityKind, records: &[Value]) -> Vec<String> {
    let schema = check_schema(kind, records, 0);
    find_duplicates(kind, records, 0, &schema.invalid_records)
}

fn check_record(
    kind: EntityKind,
    index: usize,
    record: &Map<String, Value>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    for spec in kind.fields() {
        match record.get(spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    errors.push(format!("record {}: {}: required field is missing", index, spec.name));
                }
            }
            Some(value) => {
                if let Err(reason) = check_value(spec.ty, value) {
                    errors.push(format!("record {}: {}: {}", index, spec.name, reason));
                }
            }
        }
    }

    for name in record.keys() {
        if kind.field(name).is_none() {
            warnings.push(format!("record {}: unknown field '{}' ignored", index, name));
        }
    }
}

fn check_value(ty: FieldType, value: &Value) -> Result<(), String> {
    match ty {
        FieldType::Text { max_len } => {
            let text = expect_str(value)?;
            let len = text.chars().count();
            if len > max_len {
                return Err(format!("exceeds {} characters ({})", max_len, len));
            }
            Ok(())
        }
        FieldType::Email => {
            let text = expect_str(value)?;
            let email = EMAIL_REGEX
                .as_ref()
                .map_err(|e| format!("email check unavailable: {}", e))?;
            if email.is_match(text) {
                Ok(())
            } else {
                Err(format!("invalid email address '{}'", text))
            }
        }
        FieldType::Url => {
            let text = expect_str(value)?;
            match url::Url::parse(text) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
                Ok(url) => Err(format!("unsupported URL scheme '{}'", url.scheme())),
                Err(e) => Err(format!("invalid URL: {}", e)),
            }
        }
        FieldType::Integer => match value.as_i64() {
            Some(n) if n > 0 => Ok(()),
            Some(n) => Err(format!("expected a positive integer, got {}", n)),
            None => Err(format!("expected an integer, got {}", json_type(value))),
        },
        FieldType::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                Err(format!("expected a boolean, got {}", json_type(value)))
            }
        }
        FieldType::Timestamp => {
            let text = expect_str(value)?;
            if parses_as_timestamp(text) {
                Ok(())
            } else {
                Err(format!("invalid timestamp '{}'", text))
            }
        }
    }
}

fn expect_str(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected text, got {}", json_type(value)))
}

fn parses_as_timestamp(text: &str) -> bool {
    DateTime::parse_from_rfc3339(text).is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn find_duplicates(
    kind: EntityKind,
    records: &[Value],
    offset: usize,
    invalid_records: &[usize],
) -> Vec<String> {
    let mut warnings = Vec::new();
    let key = kind.natural_key();
    let key_names = key.iter().map(|f| f.column).collect::<Vec<_>>().join("/");
    let mut seen: HashMap<Vec<String>, usize> = HashMap::new();

    for (position, record) in records.iter().enumerate() {
        let index = offset + position;
        if invalid_records.binary_search(&index).is_ok() {
            continue;
        }
        let Value::Object(map) = record else { continue };

        let Some(parts) = key
            .iter()
            .map(|field| {
                map.get(field.column).filter(|v| !v.is_null()).map(|v| {
                    let text = display_value(v);
                    if field.case_insensitive { text.to_lowercase() } else { text }
                })
            })
            .collect::<Option<Vec<String>>>()
        else {
            continue;
        };

        match seen.get(&parts) {
            Some(first) => warnings.push(format!(
                "records {} and {} share the same {} ({})",
                first,
                index,
                key_names,
                parts.join(", ")
            )),
            None => {
                seen.insert(parts, index);
            }
        }
    }
    warnings
}
