//! Account routes: register, login, logout, csrf and password change.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use super::{clear_session_cookie, csrf_session, session_from_headers, set_session_cookie, AppState};
use crate::error::AppResult;
use crate::identity::{ChangePasswordRequest, LoginRequest, RegisterRequest};

pub async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> AppResult<(StatusCode, Json<Value>)> {
    state.auth.register(&req).await?;
    Ok((StatusCode::CREATED, Json(json!({"status": "ok", "role": "viewer"}))))
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> AppResult<(HeaderMap, Json<Value>)> {
    let session = state.auth.login(&req).await?;
    let mut headers = HeaderMap::new();
    headers.insert("set-cookie", set_session_cookie(&session.token)?);
    Ok((
        headers,
        Json(json!({
            "status": "ok",
            "email": session.principal.email,
            "role": session.principal.role,
            "csrf": session.csrf_token,
        })),
    ))
}

/// Always clears the cookie; a live session additionally needs its CSRF token.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> AppResult<(HeaderMap, Json<Value>)> {
    if let Ok(session) = session_from_headers(&state, &headers) {
        super::require_csrf(&session, &headers)?;
        state.auth.logout(&session.token);
    }
    let mut h = HeaderMap::new();
    h.insert("set-cookie", clear_session_cookie());
    Ok((h, Json(json!({"status": "ok"}))))
}

pub async fn csrf(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = session_from_headers(&state, &headers)?;
    Ok(Json(json!({"status": "ok", "csrf": session.csrf_token})))
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<Json<Value>> {
    let session = csrf_session(&state, &headers)?;
    state.auth.change_password(&session, &req).await?;
    Ok(Json(json!({"status": "ok"})))
}
