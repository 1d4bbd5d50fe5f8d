//! Conversion between positional rows and typed records.
//!
//! This is the single place where untyped cell content becomes a typed
//! [`FieldValue`]. Decoding never fails: a cell that does not coerce to its
//! column type is kept as the raw string so validation can report it later.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat};
use regex::Regex;
use std::sync::LazyLock;

use super::schema::{ColumnType, TableSchema};
use super::types::{CellValue, FieldValue, Record};

/// Plain decimal numbers only. Leading zeros are rejected so identifiers
/// such as "0042" stay text.
static NUMERIC_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?$").expect("valid numeric pattern"));

/// Decode a row into a record by zipping the live header with the cells.
/// Columns the schema does not declare are ignored, blank cells are omitted,
/// and a short row simply leaves the trailing fields absent.
pub fn decode_row(schema: &TableSchema, layout: &[String], cells: &[CellValue]) -> Record {
    let mut record = Record::new();

    for column in &schema.columns {
        let Some(pos) = layout.iter().position(|h| *h == column.name) else {
            continue;
        };
        let cell = cells.get(pos).unwrap_or(&CellValue::Empty);
        let value = decode_cell(cell, column.column_type);
        if !value.is_null() {
            record.set(column.name.clone(), value);
        }
    }

    record
}

/// Encode a record against the live header. Schema columns absent from the
/// record are written blank; record fields outside the schema are dropped.
pub fn encode_record(schema: &TableSchema, layout: &[String], record: &Record) -> Vec<CellValue> {
    encode_onto(schema, layout, record, &[])
}

/// Like [`encode_record`], but header columns unknown to the schema keep the
/// content of `base` so a rewrite never blanks data this store does not own.
/// Values whose column is missing from the live header cannot be written and
/// are logged.
pub fn encode_onto(
    schema: &TableSchema,
    layout: &[String],
    record: &Record,
    base: &[CellValue],
) -> Vec<CellValue> {
    let unplaced = unplaced_fields(layout, record);
    if !unplaced.is_empty() {
        tracing::warn!(
            table = %schema.name,
            fields = ?unplaced,
            "live header lacks columns; these values were not written"
        );
    }

    layout
        .iter()
        .enumerate()
        .map(|(pos, name)| {
            if schema.has_column(name) {
                record.get(name).map(encode_value).unwrap_or(CellValue::Empty)
            } else {
                base.get(pos).cloned().unwrap_or(CellValue::Empty)
            }
        })
        .collect()
}

/// Non-empty record fields with no column in the live header
pub fn unplaced_fields(layout: &[String], record: &Record) -> Vec<String> {
    record
        .iter()
        .filter(|(name, value)| !value.is_empty() && !layout.contains(*name))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Record fields that have no column in the schema
pub fn unknown_fields(schema: &TableSchema, record: &Record) -> Vec<String> {
    record
        .iter()
        .filter(|(name, _)| !schema.has_column(name))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Convert one raw cell according to the declared column type
pub fn decode_cell(cell: &CellValue, column_type: ColumnType) -> FieldValue {
    if cell.is_blank() {
        return FieldValue::Null;
    }

    match (column_type, cell) {
        (ColumnType::Text, c) => FieldValue::String(c.as_text()),

        (ColumnType::Number, CellValue::Number(n)) => FieldValue::Number(*n),
        (ColumnType::Number, CellValue::String(s)) => {
            parse_number(s).map(FieldValue::Number).unwrap_or_else(|| FieldValue::String(s.clone()))
        }

        (ColumnType::Boolean, CellValue::Boolean(b)) => FieldValue::Boolean(*b),
        (ColumnType::Boolean, CellValue::String(s)) => {
            parse_bool(s).map(FieldValue::Boolean).unwrap_or_else(|| FieldValue::String(s.clone()))
        }

        (ColumnType::Date, CellValue::String(s)) => {
            parse_date(s).unwrap_or_else(|| FieldValue::String(s.clone()))
        }

        (ColumnType::Json, CellValue::String(s)) => {
            parse_json(s).unwrap_or_else(|| FieldValue::String(s.clone()))
        }

        (ColumnType::Any, CellValue::String(s)) => sniff(s),

        (_, CellValue::Number(n)) => FieldValue::Number(*n),
        (_, CellValue::Boolean(b)) => FieldValue::Boolean(*b),
        (_, c) => FieldValue::String(c.as_text()),
    }
}

/// Convert a typed value into the cell written to the sheet
pub fn encode_value(value: &FieldValue) -> CellValue {
    match value {
        FieldValue::Null => CellValue::Empty,
        FieldValue::Boolean(b) => CellValue::Boolean(*b),
        FieldValue::Number(n) if n.is_finite() => CellValue::Number(*n),
        FieldValue::Number(n) => CellValue::String(n.to_string()),
        FieldValue::Date(d) => CellValue::String(d.format("%Y-%m-%d").to_string()),
        FieldValue::DateTime(dt) => {
            CellValue::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        FieldValue::String(s) if s.is_empty() => CellValue::Empty,
        FieldValue::String(s) => CellValue::String(s.clone()),
        FieldValue::Json(v) => CellValue::String(v.to_string()),
    }
}

/// Value sniffing for untyped columns: boolean, number, date, JSON, text
fn sniff(s: &str) -> FieldValue {
    if let Some(b) = parse_bool(s) {
        return FieldValue::Boolean(b);
    }
    if let Some(n) = parse_number(s) {
        return FieldValue::Number(n);
    }
    if let Some(d) = parse_date(s) {
        return d;
    }
    if let Some(j) = parse_json(s) {
        return j;
    }
    FieldValue::String(s.to_string())
}

pub fn is_numeric_text(s: &str) -> bool {
    NUMERIC_TEXT.is_match(s.trim())
}

fn parse_number(s: &str) -> Option<f64> {
    if is_numeric_text(s) {
        s.trim().parse().ok()
    } else {
        None
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// ISO-8601 calendar dates and date-times. A date-time without an offset is
/// taken as UTC.
pub fn parse_date(s: &str) -> Option<FieldValue> {
    let s = s.trim();
    if s.len() < 10 || !s.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if s.len() == 10 {
        return NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(FieldValue::Date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(FieldValue::DateTime(dt));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| FieldValue::DateTime(naive.and_utc().fixed_offset()))
}

fn parse_json(s: &str) -> Option<FieldValue> {
    let trimmed = s.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(s).ok().map(FieldValue::Json)
}

/// Numeric reading of a field, shared by queries and aggregates
pub fn coerce_number(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Number(n) if n.is_finite() => Some(*n),
        FieldValue::String(s) => parse_number(s),
        _ => None,
    }
}

/// Point-in-time reading of a field. Calendar dates become midnight UTC.
pub fn coerce_date(value: &FieldValue) -> Option<DateTime<FixedOffset>> {
    match value {
        FieldValue::DateTime(dt) => Some(*dt),
        FieldValue::Date(d) => d.and_hms_opt(0, 0, 0).map(|n| n.and_utc().fixed_offset()),
        FieldValue::String(s) => parse_date(s).and_then(|v| coerce_date(&v)),
        _ => None,
    }
}

pub fn coerce_bool(value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Boolean(b) => Some(*b),
        FieldValue::String(s) => parse_bool(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::schema::SchemaRegistry;

    fn text(s: &str) -> CellValue {
        CellValue::String(s.to_string())
    }

    #[test]
    fn test_decode_typed_columns() {
        assert_eq!(decode_cell(&text("42"), ColumnType::Number), FieldValue::Number(42.0));
        assert_eq!(decode_cell(&text("4x"), ColumnType::Number), FieldValue::String("4x".into()));
        assert_eq!(decode_cell(&text("TRUE"), ColumnType::Boolean), FieldValue::Boolean(true));
        assert_eq!(
            decode_cell(&text("2024-03-01"), ColumnType::Date),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert_eq!(
            decode_cell(&text(r#"{"a":1}"#), ColumnType::Json),
            FieldValue::Json(serde_json::json!({"a": 1}))
        );
        // Text columns never coerce
        assert_eq!(decode_cell(&text("42"), ColumnType::Text), FieldValue::String("42".into()));
        assert_eq!(decode_cell(&CellValue::Number(7.0), ColumnType::Text), FieldValue::String("7".into()));
    }

    #[test]
    fn test_decode_sniffs_untyped_columns() {
        assert_eq!(decode_cell(&text("false"), ColumnType::Any), FieldValue::Boolean(false));
        assert_eq!(decode_cell(&text("-3.5"), ColumnType::Any), FieldValue::Number(-3.5));
        assert_eq!(decode_cell(&text("0042"), ColumnType::Any), FieldValue::String("0042".into()));
        assert!(matches!(
            decode_cell(&text("2024-03-01T10:00:00Z"), ColumnType::Any),
            FieldValue::DateTime(_)
        ));
        assert_eq!(
            decode_cell(&text("[1,2]"), ColumnType::Any),
            FieldValue::Json(serde_json::json!([1, 2]))
        );
    }

    #[test]
    fn test_malformed_json_falls_back_to_text() {
        assert_eq!(
            decode_cell(&text("{not json"), ColumnType::Json),
            FieldValue::String("{not json".into())
        );
        assert_eq!(
            decode_cell(&text("[oops"), ColumnType::Any),
            FieldValue::String("[oops".into())
        );
    }

    #[test]
    fn test_decode_short_row() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("clients").unwrap();
        let layout = schema.header();

        let record = decode_row(schema, &layout, &[text("client_1"), text("Acme")]);
        assert_eq!(record.id(), Some("client_1"));
        assert_eq!(record.get("name"), Some(&FieldValue::String("Acme".into())));
        assert_eq!(record.get("email"), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_encode_drops_unknown_fields_and_blanks_missing() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("clients").unwrap();
        let layout = schema.header();

        let record = Record::new()
            .with("id", "client_1")
            .with("name", "Acme")
            .with("favourite_colour", "blue");
        let cells = encode_record(schema, &layout, &record);

        assert_eq!(cells.len(), layout.len());
        assert_eq!(cells[0], text("client_1"));
        assert_eq!(cells[1], text("Acme"));
        assert!(cells[2..].iter().all(|c| *c == CellValue::Empty));
        assert_eq!(unknown_fields(schema, &record), vec!["favourite_colour".to_string()]);
    }

    #[test]
    fn test_encode_onto_keeps_foreign_columns() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("clients").unwrap();
        let layout = vec!["id".to_string(), "legacy_code".to_string(), "name".to_string()];
        let base = vec![text("client_1"), text("L-9"), text("Old")];

        let record = Record::new().with("id", "client_1").with("name", "New");
        let cells = encode_onto(schema, &layout, &record, &base);

        assert_eq!(cells, vec![text("client_1"), text("L-9"), text("New")]);
    }

    #[test]
    fn test_unplaced_fields_against_drifted_header() {
        let layout = vec!["id".to_string(), "name".to_string()];
        let record = Record::new()
            .with("id", "client_1")
            .with("name", "Acme")
            .with("email", "a@acme.test")
            .with("phone", "");

        assert_eq!(unplaced_fields(&layout, &record), vec!["email".to_string()]);
        assert!(unplaced_fields(&layout, &Record::new().with("id", "client_1")).is_empty());
    }

    #[test]
    fn test_round_trip_through_cells() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.get("invoices").unwrap();
        let layout = schema.header();

        let record = Record::new()
            .with("id", "invoice_1")
            .with("invoice_number", "INV-0007")
            .with("client_id", "client_1")
            .with("issue_date", NaiveDate::from_ymd_opt(2024, 5, 2).unwrap())
            .with("status", "sent")
            .with("line_items", FieldValue::Json(serde_json::json!([{"qty": 2, "price": 50}])))
            .with("total", 100.0)
            .with("paid", false);

        let cells = encode_record(schema, &layout, &record);
        let wire: Vec<CellValue> = cells.iter().map(|c| CellValue::from_json(&c.to_json())).collect();
        assert_eq!(decode_row(schema, &layout, &wire), record);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(coerce_number(&FieldValue::String("20".into())), Some(20.0));
        assert_eq!(coerce_number(&FieldValue::String("bad".into())), None);
        assert_eq!(coerce_number(&FieldValue::Boolean(true)), None);
        assert!(coerce_date(&FieldValue::String("2024-01-01".into())).is_some());
        assert_eq!(coerce_bool(&FieldValue::String("False".into())), Some(false));
    }
}
