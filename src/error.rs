//! Unified application error model and mapping helpers.
//! Every handler funnels failures through `AppError`, which carries a stable code,
//! a human-readable message and the HTTP status it renders as.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    Validation { code: String, message: String },
    Authentication { code: String, message: String },
    Csrf { code: String, message: String },
    Authorization { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    Database { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Validation { code, .. }
            | AppError::Authentication { code, .. }
            | AppError::Csrf { code, .. }
            | AppError::Authorization { code, .. }
            | AppError::NotFound { code, .. }
            | AppError::Conflict { code, .. }
            | AppError::Database { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Validation { message, .. }
            | AppError::Authentication { message, .. }
            | AppError::Csrf { message, .. }
            | AppError::Authorization { message, .. }
            | AppError::NotFound { message, .. }
            | AppError::Conflict { message, .. }
            | AppError::Database { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn validation<S: Into<String>>(code: S, msg: S) -> Self { AppError::Validation { code: code.into(), message: msg.into() } }
    pub fn authentication<S: Into<String>>(code: S, msg: S) -> Self { AppError::Authentication { code: code.into(), message: msg.into() } }
    pub fn csrf<S: Into<String>>(code: S, msg: S) -> Self { AppError::Csrf { code: code.into(), message: msg.into() } }
    pub fn authorization<S: Into<String>>(code: S, msg: S) -> Self { AppError::Authorization { code: code.into(), message: msg.into() } }
    pub fn not_found<S: Into<String>>(code: S, msg: S) -> Self { AppError::NotFound { code: code.into(), message: msg.into() } }
    pub fn conflict<S: Into<String>>(code: S, msg: S) -> Self { AppError::Conflict { code: code.into(), message: msg.into() } }
    pub fn database<S: Into<String>>(code: S, msg: S) -> Self { AppError::Database { code: code.into(), message: msg.into() } }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self { AppError::Internal { code: code.into(), message: msg.into() } }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Validation { .. } => 400,
            AppError::Authentication { .. } => 401,
            AppError::Csrf { .. } => 403,
            AppError::Authorization { .. } => 403,
            AppError::NotFound { .. } => 404,
            AppError::Conflict { .. } => 409,
            AppError::Database { .. } => 502,
            AppError::Internal { .. } => 500,
        }
    }

    pub fn is_authorization(&self) -> bool { matches!(self, AppError::Authorization { .. }) }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Prefer an AppError carried inside the anyhow chain
        match err.downcast::<AppError>() {
            Ok(app) => app,
            Err(other) => AppError::Internal { code: "internal".into(), message: other.to_string() },
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::not_found("not_found", "the record is not found"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                AppError::Conflict { code: "duplicate".into(), message: db.message().to_string() }
            }
            sqlx::Error::Database(db) => AppError::Database { code: "db_error".into(), message: db.message().to_string() },
            _ => AppError::Database { code: "db_error".into(), message: err.to_string() },
        }
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Validation { code: "csv_error".into(), message: format!("csv error: {}", err) }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match &self {
            AppError::Internal { .. } | AppError::Database { .. } => {
                tracing::error!(code = self.code_str(), "request failed: {}", self.message());
            }
            _ => tracing::debug!(code = self.code_str(), "request rejected: {}", self.message()),
        }
        let body = serde_json::json!({
            "status": "error",
            "code": self.code_str(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(AppError::validation("bad_input", "oops").http_status(), 400);
        assert_eq!(AppError::authentication("auth", "no").http_status(), 401);
        assert_eq!(AppError::csrf("csrf", "blocked").http_status(), 403);
        assert_eq!(AppError::authorization("forbidden", "no write").http_status(), 403);
        assert_eq!(AppError::not_found("not_found", "missing").http_status(), 404);
        assert_eq!(AppError::conflict("duplicate", "dup").http_status(), 409);
        assert_eq!(AppError::database("db_error", "fail").http_status(), 502);
        assert_eq!(AppError::internal("internal", "panic").http_status(), 500);
    }

    #[test]
    fn anyhow_keeps_inner_app_error() {
        let inner = AppError::authorization("forbidden", "nope");
        let wrapped: anyhow::Error = inner.clone().into();
        assert_eq!(AppError::from(wrapped), inner);

        let plain = anyhow::anyhow!("boom");
        let mapped = AppError::from(plain);
        assert_eq!(mapped.code_str(), "internal");
        assert_eq!(mapped.message(), "boom");
    }

    #[test]
    fn display_has_code_and_message() {
        let e = AppError::validation("password_mismatch", "passwords do not match");
        assert_eq!(e.to_string(), "password_mismatch: passwords do not match");
    }
}
