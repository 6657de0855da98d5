//! Pool controller server binary
//!
//! Usage: `pool-server [CONFIG_PATH]`

use anyhow::Context;
use pool_service::{Config, Service};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("POOL_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting pool controller");

    // Load configuration
    let config = Config::load(std::env::args_os().nth(1).map(PathBuf::from))
        .context("Config error")?;

    let service = Service::from_config(config).context("Startup failed")?;
    service.serve().await.context("Server error")?;

    Ok(())
}
