//! Browser routes. Each handler locks the session's browser state for the
//! whole request, so one session's actions run strictly in order.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{csrf_session, session_from_headers, AppState};
use crate::browser::BrowserState;
use crate::error::{AppError, AppResult};
use crate::grid::TableId;
use crate::identity::Session;

#[derive(Debug, Deserialize)]
pub struct OpenPayload {
    /// Either `schema.table`, or a bare table name when `schema` is given.
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FilterPayload {
    pub clause: String,
}

#[derive(Debug, Deserialize)]
pub struct RowsPayload {
    pub rows: Vec<Vec<Value>>,
}

async fn view_json(state: &AppState, session: &Session, browser: &BrowserState) -> AppResult<Json<Value>> {
    let view = state.browser.view(&session.principal, browser).await?;
    Ok(Json(json!({"status": "ok", "browser": view})))
}

pub async fn schemas(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = session_from_headers(&state, &headers)?;
    let schemas = state.browser.resolver().list_visible_schemas(&session.principal.email).await?;
    Ok(Json(json!({"status": "ok", "schemas": schemas})))
}

pub async fn tables(State(state): State<AppState>, headers: HeaderMap, Path(schema): Path<String>) -> AppResult<Json<Value>> {
    let session = session_from_headers(&state, &headers)?;
    let tables = state.browser.resolver().list_tables(&session.principal.email, &schema).await?;
    if tables.is_empty() {
        return Ok(Json(json!({
            "status": "ok",
            "tables": {},
            "message": format!("schema {} has no tables", schema),
        })));
    }
    Ok(Json(json!({"status": "ok", "tables": tables})))
}

pub async fn view(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = session_from_headers(&state, &headers)?;
    let browser = session.browser.lock().await;
    view_json(&state, &session, &browser).await
}

pub async fn open(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<OpenPayload>) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let id = match req.schema {
        Some(schema) => TableId::new(schema, req.table),
        None => TableId::parse(&req.table)?,
    };
    let mut browser = session.browser.lock().await;
    state.browser.open(&session.principal, &mut browser, id).await?;
    view_json(&state, &session, &browser).await
}

pub async fn apply_filter(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<FilterPayload>) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    state.browser.apply_filter(&session.principal, &mut browser, &req.clause).await?;
    view_json(&state, &session, &browser).await
}

pub async fn clear_filter(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    state.browser.clear_filter(&session.principal, &mut browser).await?;
    view_json(&state, &session, &browser).await
}

pub async fn edit_rows(State(state): State<AppState>, headers: HeaderMap, Json(req): Json<RowsPayload>) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    let rows = state.browser.edit_rows(&mut browser, &req.rows)?;
    Ok(Json(json!({"status": "ok", "rows": rows})))
}

pub async fn commit(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    state.browser.commit(&session.principal, &mut browser).await?;
    view_json(&state, &session, &browser).await
}

pub async fn rollback(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    state.browser.rollback(&session.principal, &mut browser).await?;
    view_json(&state, &session, &browser).await
}

pub async fn export(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    let session = session_from_headers(&state, &headers)?;
    let browser = session.browser.lock().await;
    let file = state.browser.export_csv(&session.principal, &browser).await?;
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file.file_name.replace('"', "")))
        .map_err(|e| AppError::internal("header".to_string(), e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.bytes,
    )
        .into_response())
}

/// Body is the raw CSV file.
pub async fn import_preview(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    let preview = state.browser.import_preview(&mut browser, &body)?;
    Ok(Json(json!({"status": "ok", "preview": preview})))
}

pub async fn discard_import(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    let discarded = state.browser.discard_import(&mut browser);
    Ok(Json(json!({"status": "ok", "discarded": discarded})))
}

pub async fn confirm_import(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    let mut browser = session.browser.lock().await;
    state.browser.confirm_import(&session.principal, &mut browser).await?;
    view_json(&state, &session, &browser).await
}
