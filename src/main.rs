use anyhow::Context;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).init();

    let config = tabledesk::config::Config::from_env().context("reading configuration from environment")?;
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "startup",
        "tabledesk starting: RUST_LOG='{}', bind={}, http_port={}, backend={:?}, db={:?}",
        rust_log, config.bind, config.http_port, config.backend, config.db
    );

    tabledesk::server::run(config).await
}
