//! PostgreSQL backend over a single shared sqlx pool.
//!
//! The pool is built once at startup, handed to every session through
//! `SharedStore`, and closed explicitly on shutdown.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, warn};

use super::{Backend, NewUser, UserRecord};
use crate::config::{DbConfig, SslMode};
use crate::error::{AppError, AppResult};
use crate::grid::filter::Filter;
use crate::grid::{ddl, Cell, Column, ColumnType, TableId, TableSnapshot};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PgStore {
    pool: PgPool,
}

/// A table column as scanned: its snapshot type and the expression read for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanColumn {
    pub column: Column,
    pub expr: String,
}

impl ScanColumn {
    pub fn new(name: &str, data_type: &str) -> Self {
        let (kind, expr) = ddl::scan_expr(name, data_type);
        ScanColumn { column: Column::new(name, kind), expr }
    }
}

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

impl PgStore {
    pub async fn connect(cfg: &DbConfig) -> anyhow::Result<Self> {
        let opts = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.database)
            .ssl_mode(ssl_mode(cfg.ssl_mode));
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(opts)
            .await
            .with_context(|| format!("connecting to postgres at {}:{}/{}", cfg.host, cfg.port, cfg.database))?;
        info!(target: "tabledesk::store", host = %cfg.host, port = cfg.port, database = %cfg.database, max_connections = cfg.max_connections, "postgres pool ready");
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    async fn scan_columns(&self, id: &TableId) -> AppResult<Vec<ScanColumn>> {
        let rows = sqlx::query(
            "SELECT column_name::text AS column_name, data_type::text AS data_type \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
        )
        .bind(&id.schema)
        .bind(&id.table)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            let exists = sqlx::query("SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2")
                .bind(&id.schema)
                .bind(&id.table)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(AppError::not_found("no_such_table".to_string(), format!("table {} does not exist", id)));
            }
        }
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let name: String = r.try_get("column_name")?;
            let data_type: String = r.try_get("data_type")?;
            out.push(ScanColumn::new(&name, &data_type));
        }
        Ok(out)
    }
}

/// `SELECT` text and its parameters for a scan of `id` with an optional filter.
pub fn build_select(id: &TableId, scans: &[ScanColumn], filter: Option<&Filter>) -> AppResult<(String, Vec<Cell>)> {
    let select_list: Vec<String> = scans
        .iter()
        .map(|s| format!("{} AS {}", s.expr, ddl::quote_ident(&s.column.name)))
        .collect();
    let mut sql = ddl::select_sql(id, &select_list);
    let mut params = Vec::new();
    match filter {
        None => {}
        Some(Filter::Raw(clause)) => {
            sql.push_str(" WHERE (");
            sql.push_str(clause);
            sql.push(')');
        }
        Some(Filter::Expr(expr)) => {
            let columns: Vec<Column> = scans.iter().map(|s| s.column.clone()).collect();
            let bound = expr.bind(&columns)?;
            let column_sql = |name: &str| {
                scans
                    .iter()
                    .find(|s| s.column.name == name)
                    .map(|s| s.expr.clone())
                    .unwrap_or_else(|| ddl::quote_ident(name))
            };
            sql.push_str(" WHERE ");
            bound.write_sql(&mut sql, &mut params, &column_sql);
        }
    }
    Ok((sql, params))
}

fn bind_cell<'q>(q: Query<'q, Postgres, PgArguments>, cell: &Cell) -> Query<'q, Postgres, PgArguments> {
    match cell {
        Cell::Null => q.bind(None::<String>),
        Cell::Bool(v) => q.bind(*v),
        Cell::Int(v) => q.bind(*v),
        Cell::Float(v) => q.bind(*v),
        Cell::Text(v) => q.bind(v.clone()),
        Cell::Timestamp(v) => q.bind(*v),
        Cell::Date(v) => q.bind(*v),
    }
}

fn decode_cell(row: &PgRow, i: usize, kind: ColumnType) -> Result<Cell, sqlx::Error> {
    let cell = match kind {
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(i)?.map(Cell::Bool),
        ColumnType::Integer => row.try_get::<Option<i64>, _>(i)?.map(Cell::Int),
        ColumnType::Float => row.try_get::<Option<f64>, _>(i)?.map(Cell::Float),
        ColumnType::Text => row.try_get::<Option<String>, _>(i)?.map(Cell::Text),
        ColumnType::Timestamp => row.try_get::<Option<chrono::NaiveDateTime>, _>(i)?.map(Cell::Timestamp),
        ColumnType::Date => row.try_get::<Option<chrono::NaiveDate>, _>(i)?.map(Cell::Date),
    };
    Ok(cell.unwrap_or(Cell::Null))
}

async fn write_replacement(tx: &mut Transaction<'_, Postgres>, id: &TableId, snapshot: &TableSnapshot) -> AppResult<()> {
    sqlx::query(&ddl::drop_table_sql(id)).execute(&mut **tx).await?;
    sqlx::query(&ddl::create_table_sql(id, &snapshot.columns)).execute(&mut **tx).await?;
    if snapshot.rows.is_empty() {
        return Ok(());
    }
    if snapshot.width() == 0 {
        let sql = format!("INSERT INTO {} DEFAULT VALUES", id.qualified());
        for _ in &snapshot.rows {
            sqlx::query(&sql).execute(&mut **tx).await?;
        }
        return Ok(());
    }
    let prefix = ddl::insert_prefix(id, &snapshot.columns);
    let per_stmt = ddl::rows_per_insert(snapshot.width());
    for chunk in snapshot.rows.chunks(per_stmt) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(prefix.as_str());
        qb.push_values(chunk.iter(), |mut b, row| {
            for (cell, col) in row.iter().zip(&snapshot.columns) {
                // nulls are bound with the column's type so the server never has to guess
                match (cell, col.kind) {
                    (Cell::Null, ColumnType::Boolean) => b.push_bind(None::<bool>),
                    (Cell::Null, ColumnType::Integer) => b.push_bind(None::<i64>),
                    (Cell::Null, ColumnType::Float) => b.push_bind(None::<f64>),
                    (Cell::Null, ColumnType::Text) => b.push_bind(None::<String>),
                    (Cell::Null, ColumnType::Timestamp) => b.push_bind(None::<chrono::NaiveDateTime>),
                    (Cell::Null, ColumnType::Date) => b.push_bind(None::<chrono::NaiveDate>),
                    (Cell::Bool(v), _) => b.push_bind(*v),
                    (Cell::Int(v), _) => b.push_bind(*v),
                    (Cell::Float(v), _) => b.push_bind(*v),
                    (Cell::Text(v), _) => b.push_bind(v.clone()),
                    (Cell::Timestamp(v), _) => b.push_bind(*v),
                    (Cell::Date(v), _) => b.push_bind(*v),
                };
            }
        });
        qb.build().execute(&mut **tx).await?;
        debug!(target: "tabledesk::store", table = %id, rows = chunk.len(), "inserted batch");
    }
    Ok(())
}

#[async_trait]
impl Backend for PgStore {
    fn name(&self) -> &'static str { "postgres" }

    async fn find_user(&self, email: &str) -> AppResult<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT email::text AS email, password_hash::text AS password_hash, role::text AS role, \
             requested_role::text AS requested_role FROM auth.users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(r) => Ok(Some(UserRecord {
                email: r.try_get("email")?,
                password_hash: r.try_get("password_hash")?,
                role: r.try_get("role")?,
                requested_role: r.try_get("requested_role")?,
            })),
        }
    }

    async fn insert_user(&self, user: &NewUser) -> AppResult<()> {
        let res = sqlx::query("INSERT INTO auth.users (email, password_hash, role, requested_role) VALUES ($1, $2, $3, $4)")
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.role.as_str())
            .bind(user.requested_role.as_str())
            .execute(&self.pool)
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) => match AppError::from(e) {
                AppError::Conflict { .. } => Err(AppError::conflict(
                    "duplicate_user".to_string(),
                    format!("a user with email {} already exists", user.email),
                )),
                other => Err(other),
            },
        }
    }

    async fn update_password_hash(&self, email: &str, password_hash: &str) -> AppResult<()> {
        let res = sqlx::query("UPDATE auth.users SET password_hash = $1 WHERE email = $2")
            .bind(password_hash)
            .bind(email)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(AppError::not_found("no_such_user".to_string(), format!("user {} does not exist", email)));
        }
        Ok(())
    }

    async fn visible_schemas(&self, email: &str) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT p.schema_name::text AS schema_name \
             FROM auth.users u \
             JOIN auth.user_groups ug ON u.id = ug.user_id \
             JOIN auth.group_schema_permissions p ON ug.group_id = p.group_id \
             WHERE u.email = $1 \
             ORDER BY schema_name",
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| r.try_get::<String, _>("schema_name").map_err(AppError::from)).collect()
    }

    async fn schema_permissions(&self, email: &str, schema: &str) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT p.permission::text AS permission \
             FROM auth.users u \
             JOIN auth.user_groups ug ON u.id = ug.user_id \
             JOIN auth.group_schema_permissions p ON ug.group_id = p.group_id \
             WHERE u.email = $1 AND p.schema_name = $2",
        )
        .bind(email)
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| r.try_get::<String, _>("permission").map_err(AppError::from)).collect()
    }

    async fn list_tables(&self, schema: &str) -> AppResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| r.try_get::<String, _>("table_name").map_err(AppError::from)).collect()
    }

    async fn load_table(&self, id: &TableId, filter: Option<&Filter>) -> AppResult<TableSnapshot> {
        let scans = self.scan_columns(id).await?;
        let (sql, params) = build_select(id, &scans, filter)?;
        if let Some(Filter::Raw(_)) = filter {
            warn!(target: "tabledesk::store", table = %id, "running raw filter clause");
        }
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = bind_cell(q, p);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let mut snapshot = TableSnapshot::new(scans.into_iter().map(|s| s.column).collect())?;
        for row in &rows {
            let mut cells = Vec::with_capacity(snapshot.width());
            for (i, col) in snapshot.columns.iter().enumerate() {
                cells.push(decode_cell(row, i, col.kind)?);
            }
            snapshot.rows.push(cells);
        }
        debug!(target: "tabledesk::store", table = %id, rows = snapshot.height(), filtered = filter.is_some(), "loaded table");
        Ok(snapshot)
    }

    async fn replace_table(&self, id: &TableId, snapshot: &TableSnapshot) -> AppResult<()> {
        snapshot.validate()?;
        let mut tx = self.pool.begin().await?;
        match write_replacement(&mut tx, id, snapshot).await {
            Ok(()) => {
                tx.commit().await?;
                info!(target: "tabledesk::store", table = %id, rows = snapshot.height(), "replaced table");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(target: "tabledesk::store", table = %id, "rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!(target: "tabledesk::store", "postgres pool closed");
    }
}
