//! CSV export and import for table snapshots.
//!
//! Export writes a header row followed by one record per row; nulls become
//! empty fields. Import infers a type per column from its non-empty fields,
//! trying boolean, integer, float, timestamp, date and finally text.

use chrono::NaiveDateTime;

use super::{parse_date_text, parse_timestamp_text, Cell, Column, ColumnType, TableId, TableSnapshot};
use crate::error::{AppError, AppResult};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// `<table>_<YYYYmmdd_HHMMSS>.csv`
pub fn export_file_name(id: &TableId, at: NaiveDateTime) -> String {
    format!("{}_{}.csv", id.table, at.format("%Y%m%d_%H%M%S"))
}

pub fn export_csv(snapshot: &TableSnapshot) -> AppResult<Vec<u8>> {
    if snapshot.width() == 0 {
        return Ok(Vec::new());
    }
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(snapshot.columns.iter().map(|c| c.name.as_str()))?;
    for row in &snapshot.rows {
        wtr.write_record(row.iter().map(|c| c.to_text()))?;
    }
    wtr.into_inner().map_err(|e| AppError::internal("csv_flush".to_string(), e.to_string()))
}

fn infer_bool(s: &str) -> bool {
    s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("false")
}

fn infer_float(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_digit()) && s.parse::<f64>().is_ok()
}

/// Narrowest type that accepts every non-empty field.
fn infer_type(fields: &[&str]) -> ColumnType {
    let present: Vec<&str> = fields.iter().map(|f| f.trim()).filter(|f| !f.is_empty()).collect();
    if present.is_empty() {
        return ColumnType::Text;
    }
    if present.iter().all(|f| infer_bool(f)) {
        return ColumnType::Boolean;
    }
    if present.iter().all(|f| f.parse::<i64>().is_ok()) {
        return ColumnType::Integer;
    }
    if present.iter().all(|f| infer_float(f)) {
        return ColumnType::Float;
    }
    let ts = present.iter().filter(|f| parse_timestamp_text(f).is_some()).count();
    let dates = present.iter().filter(|f| parse_date_text(f).is_some()).count();
    if ts > 0 && ts + dates == present.len() {
        return ColumnType::Timestamp;
    }
    if dates == present.len() {
        return ColumnType::Date;
    }
    ColumnType::Text
}

/// Parse an uploaded CSV into a snapshot. Empty fields import as nulls.
pub fn import_csv(bytes: &[u8]) -> AppResult<TableSnapshot> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).flexible(true).from_reader(bytes);
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if headers.is_empty() || (headers.len() == 1 && headers[0].is_empty()) {
        return Err(AppError::validation("empty_csv", "the file has no header row"));
    }
    if let Some(i) = headers.iter().position(|h| h.is_empty()) {
        return Err(AppError::validation("blank_column".to_string(), format!("column {} has no name", i + 1)));
    }

    let mut records = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() != headers.len() {
            return Err(AppError::validation(
                "row_width".to_string(),
                format!("line {} has {} fields, expected {}", i + 2, rec.len(), headers.len()),
            ));
        }
        records.push(rec);
    }

    let columns: Vec<Column> = headers
        .into_iter()
        .enumerate()
        .map(|(ci, name)| {
            let fields: Vec<&str> = records.iter().map(|r| r.get(ci).unwrap_or("")).collect();
            Column::new(name, infer_type(&fields))
        })
        .collect();
    let mut snapshot = TableSnapshot::new(columns)?;

    for (ri, rec) in records.iter().enumerate() {
        let mut row = Vec::with_capacity(rec.len());
        for (field, col) in rec.iter().zip(&snapshot.columns) {
            let cell = if field.trim().is_empty() {
                Cell::Null
            } else if col.kind == ColumnType::Text {
                Cell::Text(field.to_string())
            } else {
                Cell::parse_as(field.trim(), col.kind).map_err(|e| {
                    AppError::validation("cell_type".to_string(), format!("line {}, column '{}': {}", ri + 2, col.name, e))
                })?
            };
            row.push(cell);
        }
        snapshot.push_row(row)?;
    }
    tracing::debug!(target: "tabledesk::browser", rows = snapshot.height(), cols = snapshot.width(), "parsed csv upload");
    Ok(snapshot)
}
