//! In-memory tabular data: the snapshot a user browses and edits.
//!
//! A `TableSnapshot` is an ordered list of typed columns plus rows of cells.
//! Every non-null cell matches its column's type exactly; integers offered to a
//! float column are widened on the way in.

pub mod csv_io;
pub mod ddl;
pub mod filter;

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::Value;

use crate::error::{AppError, AppResult};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new<S: Into<String>>(schema: S, table: S) -> Self {
        TableId { schema: schema.into(), table: table.into() }
    }

    /// Parse `schema.table`; the first dot separates the two parts.
    pub fn parse(s: &str) -> AppResult<Self> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => Ok(TableId::new(schema, table)),
            _ => Err(AppError::validation("bad_table_id".to_string(), format!("expected schema.table, got '{}'", s))),
        }
    }

    /// Quoted form for SQL text.
    pub fn qualified(&self) -> String {
        format!("{}.{}", ddl::quote_ident(&self.schema), ddl::quote_ident(&self.table))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl Serialize for TableId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Timestamp,
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, kind: ColumnType) -> Self {
        Column { name: name.into(), kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

fn parse_bool_text(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" => Some(true),
        "false" | "f" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_timestamp_text(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .ok()
}

pub(crate) fn parse_date_text(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

impl Cell {
    pub fn is_null(&self) -> bool { matches!(self, Cell::Null) }

    /// Whether this cell may live in a column of `kind`.
    pub fn fits(&self, kind: ColumnType) -> bool {
        matches!(
            (self, kind),
            (Cell::Null, _)
                | (Cell::Bool(_), ColumnType::Boolean)
                | (Cell::Int(_), ColumnType::Integer)
                | (Cell::Float(_), ColumnType::Float)
                | (Cell::Text(_), ColumnType::Text)
                | (Cell::Timestamp(_), ColumnType::Timestamp)
                | (Cell::Date(_), ColumnType::Date)
        )
    }

    /// Parse a textual cell (CSV field, grid input) as `kind`. Empty text is null
    /// except in text columns.
    pub fn parse_as(text: &str, kind: ColumnType) -> Result<Cell, String> {
        if text.is_empty() && kind != ColumnType::Text {
            return Ok(Cell::Null);
        }
        let bad = || format!("'{}' is not a valid {}", text, kind.as_str());
        match kind {
            ColumnType::Text => Ok(Cell::Text(text.to_string())),
            ColumnType::Boolean => parse_bool_text(text).map(Cell::Bool).ok_or_else(bad),
            ColumnType::Integer => text.trim().parse::<i64>().map(Cell::Int).map_err(|_| bad()),
            ColumnType::Float => text.trim().parse::<f64>().map(Cell::Float).map_err(|_| bad()),
            ColumnType::Timestamp => parse_timestamp_text(text)
                .or_else(|| parse_date_text(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .map(Cell::Timestamp)
                .ok_or_else(bad),
            ColumnType::Date => parse_date_text(text).map(Cell::Date).ok_or_else(bad),
        }
    }

    /// Coerce a JSON value submitted by the grid into a cell of `kind`.
    pub fn coerce_json(value: &Value, kind: ColumnType) -> Result<Cell, String> {
        match (value, kind) {
            (Value::Null, _) => Ok(Cell::Null),
            (Value::String(s), _) => Cell::parse_as(s, kind),
            (Value::Bool(b), ColumnType::Boolean) => Ok(Cell::Bool(*b)),
            (Value::Bool(b), ColumnType::Text) => Ok(Cell::Text(b.to_string())),
            (Value::Number(n), ColumnType::Integer) => {
                if let Some(i) = n.as_i64() {
                    Ok(Cell::Int(i))
                } else {
                    match n.as_f64() {
                        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => Ok(Cell::Int(f as i64)),
                        _ => Err(format!("{} is not a valid integer", n)),
                    }
                }
            }
            (Value::Number(n), ColumnType::Float) => n.as_f64().map(Cell::Float).ok_or_else(|| format!("{} is not a valid float", n)),
            (Value::Number(n), ColumnType::Text) => Ok(Cell::Text(n.to_string())),
            (Value::Array(_), _) | (Value::Object(_), _) => Err("nested values are not supported".to_string()),
            (other, kind) => Err(format!("{} is not a valid {}", other, kind.as_str())),
        }
    }

    /// Text rendering used for CSV export.
    pub fn to_text(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Bool(b) => b.to_string(),
            Cell::Int(i) => i.to_string(),
            // Debug keeps a decimal point or exponent so the value re-imports as float
            Cell::Float(f) => format!("{:?}", f),
            Cell::Text(s) => s.clone(),
            Cell::Timestamp(t) => t.format(TIMESTAMP_FORMAT).to_string(),
            Cell::Date(d) => d.format(DATE_FORMAT).to_string(),
        }
    }

    /// SQL-style comparison; `None` when either side is null or the kinds are unrelated.
    pub fn compare(&self, other: &Cell) -> Option<Ordering> {
        match (self, other) {
            (Cell::Null, _) | (_, Cell::Null) => None,
            (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
            (Cell::Int(a), Cell::Int(b)) => Some(a.cmp(b)),
            (Cell::Int(a), Cell::Float(b)) => (*a as f64).partial_cmp(b),
            (Cell::Float(a), Cell::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Cell::Float(a), Cell::Float(b)) => a.partial_cmp(b),
            (Cell::Text(a), Cell::Text(b)) => Some(a.cmp(b)),
            (Cell::Timestamp(a), Cell::Timestamp(b)) => Some(a.cmp(b)),
            (Cell::Date(a), Cell::Date(b)) => Some(a.cmp(b)),
            (Cell::Timestamp(a), Cell::Date(b)) => b.and_hms_opt(0, 0, 0).map(|b| a.cmp(&b)),
            (Cell::Date(a), Cell::Timestamp(b)) => a.and_hms_opt(0, 0, 0).map(|a| a.cmp(b)),
            _ => None,
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cell::Null => serializer.serialize_none(),
            Cell::Bool(b) => serializer.serialize_bool(*b),
            Cell::Int(i) => serializer.serialize_i64(*i),
            Cell::Float(f) => serializer.serialize_f64(*f),
            Cell::Text(s) => serializer.serialize_str(s),
            Cell::Timestamp(_) | Cell::Date(_) => serializer.serialize_str(&self.to_text()),
        }
    }
}

/// Working copy of a table's contents.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSnapshot {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Cell>>,
}

impl TableSnapshot {
    pub fn new(columns: Vec<Column>) -> AppResult<Self> {
        for (i, c) in columns.iter().enumerate() {
            if columns[..i].iter().any(|p| p.name == c.name) {
                return Err(AppError::validation("duplicate_column".to_string(), format!("duplicate column name '{}'", c.name)));
            }
        }
        Ok(TableSnapshot { columns, rows: Vec::new() })
    }

    pub fn width(&self) -> usize { self.columns.len() }
    pub fn height(&self) -> usize { self.rows.len() }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Check one row against the column list.
    pub fn check_row(&self, index: usize, row: &[Cell]) -> AppResult<()> {
        if row.len() != self.columns.len() {
            return Err(AppError::validation(
                "row_width".to_string(),
                format!("row {} has {} cells, expected {}", index + 1, row.len(), self.columns.len()),
            ));
        }
        for (cell, col) in row.iter().zip(&self.columns) {
            if !cell.fits(col.kind) {
                return Err(AppError::validation(
                    "cell_type".to_string(),
                    format!("row {}: value {:?} does not fit {} column '{}'", index + 1, cell, col.kind.as_str(), col.name),
                ));
            }
        }
        Ok(())
    }

    pub fn push_row(&mut self, row: Vec<Cell>) -> AppResult<()> {
        self.check_row(self.rows.len(), &row)?;
        self.rows.push(row);
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        for (i, row) in self.rows.iter().enumerate() {
            self.check_row(i, row)?;
        }
        Ok(())
    }

    /// Build rows from grid input, coercing each value to its column's type.
    pub fn rows_from_json(columns: &[Column], rows: &[Vec<Value>]) -> AppResult<Vec<Vec<Cell>>> {
        let mut out = Vec::with_capacity(rows.len());
        for (ri, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(AppError::validation(
                    "row_width".to_string(),
                    format!("row {} has {} cells, expected {}", ri + 1, row.len(), columns.len()),
                ));
            }
            let mut cells = Vec::with_capacity(row.len());
            for (v, col) in row.iter().zip(columns) {
                let cell = Cell::coerce_json(v, col.kind)
                    .map_err(|e| AppError::validation("cell_type".to_string(), format!("row {}, column '{}': {}", ri + 1, col.name, e)))?;
                cells.push(cell);
            }
            out.push(cells);
        }
        Ok(out)
    }
}

impl Serialize for TableSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("TableSnapshot", 2)?;
        st.serialize_field("columns", &self.columns)?;
        st.serialize_field("rows", &self.rows)?;
        st.end()
    }
}
