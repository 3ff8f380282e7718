//!
//! tabledesk HTTP server
//! ---------------------
//! Axum router exposing one route per user action.
//!
//! Responsibilities:
//! - Session management with a cookie + CSRF token model: login sets an
//!   HttpOnly session cookie and returns the CSRF token, every mutating route
//!   except register/login requires it in the `x-csrf-token` header.
//! - Account routes (register, login, logout, password change).
//! - Browser routes (schemas, tables, open/filter/edit/commit/rollback, CSV).
//! - Backend construction at startup and pool shutdown on exit.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, HeaderValue};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::browser::Browser;
use crate::config::{BackendKind, Config};
use crate::error::{AppError, AppResult};
use crate::identity::{AuthService, PermissionResolver, Session, SessionManager};
use crate::storage::memory::MemoryStore;
use crate::storage::postgres::PgStore;
use crate::storage::SharedStore;

pub mod auth_routes;
pub mod browser_routes;

pub const SESSION_COOKIE: &str = "tabledesk_session";
pub const CSRF_HEADER: &str = "x-csrf-token";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub auth: AuthService,
    pub browser: Browser,
}

impl AppState {
    pub fn new(store: SharedStore, raw_filters: bool) -> Self {
        let sessions = SessionManager::new();
        let resolver = PermissionResolver::new(store.clone());
        AppState {
            auth: AuthService::new(store.clone(), sessions),
            browser: Browser::new(store.clone(), resolver, raw_filters),
            store,
        }
    }
}

pub(crate) fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie")?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some((k, v)) = p.split_once('=') {
            if k == name { return Some(v.to_string()); }
        }
    }
    None
}

/// Session named by the request's cookie.
pub(crate) fn session_from_headers(state: &AppState, headers: &HeaderMap) -> AppResult<Arc<Session>> {
    parse_cookie(headers, SESSION_COOKIE)
        .and_then(|token| state.auth.sessions().get(&token))
        .ok_or_else(|| AppError::authentication("not_logged_in", "log in first"))
}

pub(crate) fn require_csrf(session: &Session, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok());
    match provided {
        Some(p) if p == session.csrf_token => Ok(()),
        _ => Err(AppError::csrf("invalid_csrf", "missing or invalid csrf token")),
    }
}

/// Logged-in session whose CSRF header checks out.
pub(crate) fn csrf_session(state: &AppState, headers: &HeaderMap) -> AppResult<Arc<Session>> {
    let session = session_from_headers(state, headers)?;
    require_csrf(&session, headers)?;
    Ok(session)
}

pub(crate) fn set_session_cookie(token: &str) -> AppResult<HeaderValue> {
    // Secure, HttpOnly cookie scoped to path / with SameSite=Strict
    HeaderValue::from_str(&format!("{}={}; HttpOnly; Secure; SameSite=Strict; Path=/", SESSION_COOKIE, token))
        .map_err(|e| AppError::internal("cookie".to_string(), e.to_string()))
}

pub(crate) fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("tabledesk_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/")
}

async fn root() -> Json<Value> {
    Json(json!({"status": "ok", "service": "tabledesk"}))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/register", post(auth_routes::register))
        .route("/login", post(auth_routes::login))
        .route("/logout", post(auth_routes::logout))
        .route("/csrf", get(auth_routes::csrf))
        .route("/password", post(auth_routes::change_password))
        .route("/schemas", get(browser_routes::schemas))
        .route("/schemas/{schema}/tables", get(browser_routes::tables))
        .route("/browser", get(browser_routes::view))
        .route("/browser/open", post(browser_routes::open))
        .route("/browser/filter", post(browser_routes::apply_filter).delete(browser_routes::clear_filter))
        .route("/browser/rows", put(browser_routes::edit_rows))
        .route("/browser/commit", post(browser_routes::commit))
        .route("/browser/rollback", post(browser_routes::rollback))
        .route("/browser/export", get(browser_routes::export))
        .route("/browser/import", post(browser_routes::import_preview).delete(browser_routes::discard_import))
        .route("/browser/import/confirm", post(browser_routes::confirm_import))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Build the configured backend.
pub async fn connect_store(config: &Config) -> anyhow::Result<SharedStore> {
    match config.backend {
        BackendKind::Postgres => {
            let db = config.db.as_ref().context("postgres backend selected but no database settings")?;
            Ok(SharedStore::new(PgStore::connect(db).await?))
        }
        BackendKind::Memory => Ok(SharedStore::new(MemoryStore::with_demo_data()?)),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "startup", "cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!(target: "startup", "shutdown requested");
}

/// Serve until ctrl-c, then close the backend.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let addr: SocketAddr = format!("{}:{}", config.bind, config.http_port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.http_port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(target: "startup", %addr, backend = store.name(), raw_filters = config.raw_filters, "tabledesk listening");
    if config.raw_filters {
        tracing::warn!(target: "startup", "raw filter clauses are enabled; users can run arbitrary read-side SQL");
    }
    let app = router(AppState::new(store.clone(), config.raw_filters));
    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    store.close().await;
    served.context("http server failed")
}
