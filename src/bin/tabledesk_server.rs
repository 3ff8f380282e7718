//!
//! tabledesk server binary
//! -----------------------
//! Command-line entry point for the tabledesk HTTP server. Reads configuration
//! from the environment; CLI flags override it.

use anyhow::{Context, Result};
use std::env;

use tabledesk::config::{parse_bool, Config};

fn parse_port_arg(args: &[String], flag: &str) -> Option<u16> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return args[i + 1].parse::<u16>().ok();
        }
        i += 1;
    }
    None
}

fn parse_value_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).cloned()
}

/// `--raw-filters` alone enables; an explicit boolean may follow.
fn parse_raw_filters_arg(args: &[String]) -> Option<bool> {
    let i = args.iter().position(|a| a == "--raw-filters")?;
    match args.get(i + 1) {
        Some(next) if !next.starts_with('-') => Some(parse_bool(next).unwrap_or(true)),
        _ => Some(true),
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("tabledesk server\n\nUSAGE:\n  tabledesk_server [--http-port N] [--bind ADDR] [--raw-filters [bool]] [--memory]\n\nOPTIONS:\n  --http-port N        HTTP port (env: TABLEDESK_HTTP_PORT, default 8501)\n  --bind ADDR          Listen address (env: TABLEDESK_BIND, default 0.0.0.0)\n  --raw-filters [bool] Pass filter clauses the grammar rejects to the database (env: TABLEDESK_RAW_FILTERS)\n  --memory             Use the in-process demo backend instead of PostgreSQL (env: TABLEDESK_BACKEND=memory)\n\nDATABASE (env): TABLEDESK_DB_HOST, _PORT, _USER, _PASSWORD or _PASSWORD_FILE, _NAME, _SSLMODE, _MAX_CONNECTIONS\n  each falling back to PGHOST, PGPORT, PGUSER, PGPASSWORD, PGDATABASE, PGSSLMODE\n");
        return Ok(());
    }

    // --memory wins over TABLEDESK_BACKEND and skips the database settings
    let memory = has_flag(&args, "--memory");
    let mut config = Config::from_lookup(&|k: &str| {
        if memory && k == "TABLEDESK_BACKEND" { Some("memory".into()) } else { env::var(k).ok() }
    })
    .context("reading configuration")?;

    // CLI arguments override environment
    if let Some(port) = parse_port_arg(&args, "--http-port") {
        config.http_port = port;
    }
    if let Some(bind) = parse_value_arg(&args, "--bind") {
        config.bind = bind;
    }
    if let Some(raw) = parse_raw_filters_arg(&args) {
        config.raw_filters = raw;
    }

    tracing::info!(
        target: "startup",
        "tabledesk starting: bind={}, http_port={}, backend={:?}, raw_filters={}",
        config.bind, config.http_port, config.backend, config.raw_filters
    );
    tabledesk::server::run(config).await
}
