use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::{self, is_numeric_text};
use super::schema::{ColumnDef, ColumnType, TableSchema};
use super::types::{FieldValue, Record, ValidationIssue};

/// One difference between the expected and the live header row.
/// Positions are 1-based, as a person reading the sheet counts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaDiff {
    MissingColumn {
        column: String,
        expected_position: usize,
    },
    ExtraColumn {
        column: String,
        position: usize,
    },
    OutOfOrder {
        column: String,
        expected_position: usize,
        actual_position: usize,
    },
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaDiff::MissingColumn { column, expected_position } => {
                write!(f, "missing column '{}' (expected at position {})", column, expected_position)
            }
            SchemaDiff::ExtraColumn { column, position } => {
                write!(f, "unexpected column '{}' at position {}", column, position)
            }
            SchemaDiff::OutOfOrder { column, expected_position, actual_position } => write!(
                f,
                "column '{}' is at position {} but expected at position {}",
                column, actual_position, expected_position
            ),
        }
    }
}

/// Compare a live header with the expected one
pub fn diff_headers(expected: &[String], live: &[String]) -> Vec<SchemaDiff> {
    let mut diffs = Vec::new();

    for (i, column) in expected.iter().enumerate() {
        if !live.contains(column) {
            diffs.push(SchemaDiff::MissingColumn {
                column: column.clone(),
                expected_position: i + 1,
            });
        }
    }

    for (i, column) in live.iter().enumerate() {
        if !column.is_empty() && !expected.contains(column) {
            diffs.push(SchemaDiff::ExtraColumn {
                column: column.clone(),
                position: i + 1,
            });
        }
    }

    // Relative order of the columns both sides share. Comparing shared
    // columns only keeps one missing column from flagging everything after it.
    let shared_expected: Vec<&String> = expected.iter().filter(|c| live.contains(c)).collect();
    let mut shared_live: Vec<&String> = Vec::new();
    for column in live.iter().filter(|c| expected.contains(c)) {
        if !shared_live.contains(&column) {
            shared_live.push(column);
        }
    }

    for (want, got) in shared_expected.iter().zip(shared_live.iter()) {
        if want != got {
            diffs.push(SchemaDiff::OutOfOrder {
                column: (*want).clone(),
                expected_position: position_of(expected, want),
                actual_position: position_of(live, want),
            });
        }
    }

    diffs
}

fn position_of(columns: &[String], name: &str) -> usize {
    columns.iter().position(|c| c == name).map(|p| p + 1).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureStatus {
    Valid,
    Drifted,
    MissingSheet,
    MissingHeader,
    /// The sheet could not be read
    Unreachable,
}

/// Result of checking one table's live structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureReport {
    pub table: String,
    pub status: StructureStatus,
    pub diffs: Vec<SchemaDiff>,
    pub error: Option<String>,
}

impl StructureReport {
    pub fn is_valid(&self) -> bool {
        self.status == StructureStatus::Valid
    }

    pub fn unreachable(table: &str, error: String) -> Self {
        StructureReport {
            table: table.to_string(),
            status: StructureStatus::Unreachable,
            diffs: Vec::new(),
            error: Some(error),
        }
    }

    /// Human-readable lines describing the problems found
    pub fn messages(&self) -> Vec<String> {
        match self.status {
            StructureStatus::Valid => Vec::new(),
            StructureStatus::MissingSheet => vec![format!("sheet '{}' does not exist", self.table)],
            StructureStatus::MissingHeader => vec![format!("sheet '{}' has no header row", self.table)],
            StructureStatus::Unreachable => vec![format!(
                "sheet '{}' could not be read: {}",
                self.table,
                self.error.as_deref().unwrap_or("unknown error")
            )],
            StructureStatus::Drifted => self.diffs.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Check a live header (`None` when the sheet is missing) against a schema.
/// Never repairs anything.
pub fn check_structure(schema: &TableSchema, live: Option<&[String]>) -> StructureReport {
    let (status, diffs) = match live {
        None => (StructureStatus::MissingSheet, Vec::new()),
        Some(header) if header.iter().all(|h| h.is_empty()) => (StructureStatus::MissingHeader, Vec::new()),
        Some(header) => {
            let diffs = diff_headers(&schema.header(), header);
            let status = if diffs.is_empty() {
                StructureStatus::Valid
            } else {
                StructureStatus::Drifted
            };
            (status, diffs)
        }
    };

    StructureReport {
        table: schema.name.clone(),
        status,
        diffs,
        error: None,
    }
}

/// Check required fields, basic types and allowed values of a record about
/// to be written. Returns every problem found rather than stopping at one.
pub fn validate_record_data(schema: &TableSchema, record: &Record) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    for column in &schema.columns {
        let value = record.get(&column.name);

        match value {
            None => {
                if column.required {
                    issues.push(ValidationIssue::new(&column.name, "is required"));
                }
            }
            Some(v) if v.is_empty() => {
                if column.required {
                    issues.push(ValidationIssue::new(&column.name, "is required and must not be empty"));
                }
            }
            Some(v) => {
                if let Some(issue) = check_type(column, v) {
                    issues.push(issue);
                } else if let Some(issue) = check_allowed(column, v) {
                    issues.push(issue);
                }
            }
        }
    }

    issues
}

fn check_type(column: &ColumnDef, value: &FieldValue) -> Option<ValidationIssue> {
    let matches = match (column.column_type, value) {
        (ColumnType::Any, _) => true,
        (ColumnType::Text, FieldValue::Json(_)) => false,
        (ColumnType::Text, _) => true,
        (ColumnType::Number, FieldValue::Number(n)) => n.is_finite(),
        (ColumnType::Number, FieldValue::String(s)) => is_numeric_text(s),
        (ColumnType::Boolean, v) => codec::coerce_bool(v).is_some(),
        (ColumnType::Date, FieldValue::Date(_) | FieldValue::DateTime(_)) => true,
        (ColumnType::Date, FieldValue::String(s)) => codec::parse_date(s).is_some(),
        (ColumnType::Json, FieldValue::Json(_)) => true,
        (ColumnType::Json, FieldValue::String(s)) => serde_json::from_str::<serde_json::Value>(s)
            .map(|v| v.is_object() || v.is_array())
            .unwrap_or(false),
        _ => false,
    };

    if matches {
        None
    } else {
        Some(ValidationIssue::new(
            &column.name,
            format!(
                "expected type '{}' but got '{}'",
                column.column_type.as_str(),
                value.type_name()
            ),
        ))
    }
}

fn check_allowed(column: &ColumnDef, value: &FieldValue) -> Option<ValidationIssue> {
    let allowed = column.allowed_values.as_ref()?;
    let text = value.to_string();
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(&text)) {
        return None;
    }
    Some(ValidationIssue::new(
        &column.name,
        format!("value '{}' is not one of: {}", text, allowed.join(", ")),
    ))
}
