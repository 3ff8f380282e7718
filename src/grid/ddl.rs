//! SQL text generation for table scans and full-table replacement.

use super::{Column, ColumnType, TableId};

/// PostgreSQL caps bind parameters per statement at 65535.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Quote an identifier for PostgreSQL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column type used when recreating a table.
pub fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Text => "TEXT",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Date => "DATE",
    }
}

pub fn drop_table_sql(id: &TableId) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", id.qualified())
}

pub fn create_table_sql(id: &TableId, columns: &[Column]) -> String {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.kind)))
        .collect();
    format!("CREATE TABLE {} ({})", id.qualified(), cols.join(", "))
}

/// `INSERT INTO t (a, b) ` prefix; the VALUES list is appended by the caller.
pub fn insert_prefix(id: &TableId, columns: &[Column]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
    format!("INSERT INTO {} ({}) ", id.qualified(), cols.join(", "))
}

/// Rows per multi-row INSERT so one statement stays under the bind limit.
pub fn rows_per_insert(width: usize) -> usize {
    if width == 0 { return 0; }
    (MAX_BIND_PARAMS / width).max(1)
}

/// Map an `information_schema.columns.data_type` to the snapshot type and an
/// expression that yields a value decodable as that type.
pub fn scan_expr(name: &str, data_type: &str) -> (ColumnType, String) {
    let q = quote_ident(name);
    match data_type {
        "boolean" => (ColumnType::Boolean, q),
        "smallint" | "integer" | "bigint" => (ColumnType::Integer, format!("{}::bigint", q)),
        "real" | "double precision" | "numeric" => (ColumnType::Float, format!("{}::double precision", q)),
        "timestamp without time zone" => (ColumnType::Timestamp, q),
        "timestamp with time zone" => (ColumnType::Timestamp, format!("({} AT TIME ZONE 'UTC')", q)),
        "date" => (ColumnType::Date, q),
        _ => (ColumnType::Text, format!("{}::text", q)),
    }
}

pub fn select_sql(id: &TableId, select_list: &[String]) -> String {
    if select_list.is_empty() {
        // zero-column tables still have rows; count them without projecting anything
        return format!("SELECT FROM {}", id.qualified());
    }
    format!("SELECT {} FROM {}", select_list.join(", "), id.qualified())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn create_table_uses_inferred_types() {
        let id = TableId::new("sales", "orders");
        let cols = vec![
            Column::new("id", ColumnType::Integer),
            Column::new("paid", ColumnType::Boolean),
            Column::new("amount", ColumnType::Float),
            Column::new("note", ColumnType::Text),
            Column::new("at", ColumnType::Timestamp),
            Column::new("day", ColumnType::Date),
        ];
        assert_eq!(
            create_table_sql(&id, &cols),
            "CREATE TABLE \"sales\".\"orders\" (\"id\" BIGINT, \"paid\" BOOLEAN, \"amount\" DOUBLE PRECISION, \"note\" TEXT, \"at\" TIMESTAMP, \"day\" DATE)"
        );
        assert_eq!(drop_table_sql(&id), "DROP TABLE IF EXISTS \"sales\".\"orders\" CASCADE");
        assert_eq!(insert_prefix(&id, &cols[..2]), "INSERT INTO \"sales\".\"orders\" (\"id\", \"paid\") ");
    }

    #[test]
    fn insert_batches_respect_bind_limit() {
        assert_eq!(rows_per_insert(0), 0);
        assert_eq!(rows_per_insert(1), 65_535);
        assert_eq!(rows_per_insert(10), 6_553);
        assert_eq!(rows_per_insert(70_000), 1);
    }

    #[test]
    fn scan_casts_unsupported_types() {
        assert_eq!(scan_expr("n", "numeric"), (ColumnType::Float, "\"n\"::double precision".to_string()));
        assert_eq!(scan_expr("u", "uuid"), (ColumnType::Text, "\"u\"::text".to_string()));
        assert_eq!(scan_expr("b", "boolean"), (ColumnType::Boolean, "\"b\"".to_string()));
        assert_eq!(scan_expr("t", "timestamp with time zone").1, "(\"t\" AT TIME ZONE 'UTC')");
    }
}
