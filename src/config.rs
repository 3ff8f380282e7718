//! Runtime configuration sourced from the environment.
//!
//! Every `TABLEDESK_DB_*` variable falls back to the matching libpq variable
//! (`PGHOST`, `PGPORT`, ...), so an existing psql environment works unchanged.
//! The password may come from a mounted secret file instead of the environment.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("unencrypted database transport is not allowed (sslmode={0})")]
    InsecureTransport(String),
    #[error("cannot read password file {path}: {reason}")]
    PasswordFile { path: PathBuf, reason: String },
}

/// TLS requirement for the database connection. Plain-text modes are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            "disable" | "allow" | "prefer" => Err(ConfigError::InsecureTransport(s.trim().to_string())),
            _ => Err(ConfigError::Invalid { name: "TABLEDESK_DB_SSLMODE", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    /// In-process tables; nothing survives a restart.
    Memory,
}

#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: SslMode,
    pub max_connections: u32,
}

// Keep the password out of logs.
impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub http_port: u16,
    /// Pass filter clauses the grammar rejects straight to the database.
    pub raw_filters: bool,
    pub backend: BackendKind,
    /// Absent when running on the in-process backend.
    pub db: Option<DbConfig>,
}

pub const DEFAULT_HTTP_PORT: u16 = 8501;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Look up `primary`, then `fallback`, treating empty values as unset.
fn lookup(get: &dyn Fn(&str) -> Option<String>, primary: &str, fallback: &str) -> Option<String> {
    get(primary)
        .filter(|v| !v.trim().is_empty())
        .or_else(|| get(fallback).filter(|v| !v.trim().is_empty()))
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl DbConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| env::var(k).ok())
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup(get, "TABLEDESK_DB_HOST", "PGHOST").ok_or(ConfigError::Missing("TABLEDESK_DB_HOST"))?;
        let port = match lookup(get, "TABLEDESK_DB_PORT", "PGPORT") {
            Some(p) => p.trim().parse::<u16>().map_err(|_| ConfigError::Invalid { name: "TABLEDESK_DB_PORT", value: p })?,
            None => 5432,
        };
        let user = lookup(get, "TABLEDESK_DB_USER", "PGUSER").ok_or(ConfigError::Missing("TABLEDESK_DB_USER"))?;
        let password = match get("TABLEDESK_DB_PASSWORD_FILE").filter(|v| !v.trim().is_empty()) {
            Some(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::PasswordFile { path: path.clone(), reason: e.to_string() })?;
                raw.trim_end_matches(['\r', '\n']).to_string()
            }
            None => lookup(get, "TABLEDESK_DB_PASSWORD", "PGPASSWORD").ok_or(ConfigError::Missing("TABLEDESK_DB_PASSWORD"))?,
        };
        let database = lookup(get, "TABLEDESK_DB_NAME", "PGDATABASE").ok_or(ConfigError::Missing("TABLEDESK_DB_NAME"))?;
        let ssl_mode = match lookup(get, "TABLEDESK_DB_SSLMODE", "PGSSLMODE") {
            Some(m) => SslMode::parse(&m)?,
            None => SslMode::default(),
        };
        let max_connections = match get("TABLEDESK_DB_MAX_CONNECTIONS") {
            Some(v) => v.trim().parse::<u32>().ok().filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid { name: "TABLEDESK_DB_MAX_CONNECTIONS", value: v })?,
            None => 10,
        };
        Ok(DbConfig { host, port, user, password, database, ssl_mode, max_connections })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|k| env::var(k).ok())
    }

    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let http_port = match get("TABLEDESK_HTTP_PORT") {
            Some(p) => p.trim().parse::<u16>().map_err(|_| ConfigError::Invalid { name: "TABLEDESK_HTTP_PORT", value: p })?,
            None => DEFAULT_HTTP_PORT,
        };
        let bind = get("TABLEDESK_BIND").filter(|b| !b.trim().is_empty()).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let raw_filters = match get("TABLEDESK_RAW_FILTERS") {
            Some(v) => parse_bool(&v).ok_or(ConfigError::Invalid { name: "TABLEDESK_RAW_FILTERS", value: v })?,
            None => false,
        };
        let backend = match get("TABLEDESK_BACKEND").map(|s| s.trim().to_ascii_lowercase()) {
            None => BackendKind::Postgres,
            Some(s) if s.is_empty() || s == "postgres" || s == "postgresql" => BackendKind::Postgres,
            Some(s) if s == "memory" => BackendKind::Memory,
            Some(s) => return Err(ConfigError::Invalid { name: "TABLEDESK_BACKEND", value: s }),
        };
        let db = match backend {
            BackendKind::Postgres => Some(DbConfig::from_lookup(get)?),
            BackendKind::Memory => None,
        };
        Ok(Config { bind, http_port, raw_filters, backend, db })
    }
}
