//! AWS Lambda APM extension binary.
//!
//! Relays Elastic APM agent telemetry from the function sandbox to the
//! configured APM server.
//!
//! # Environment Variables
//!
//! - `ELASTIC_APM_LAMBDA_APM_SERVER` - URL of the APM server
//! - `ELASTIC_APM_SECRET_TOKEN` / `ELASTIC_APM_API_KEY` - credentials
//! - `ELASTIC_APM_SEND_STRATEGY` - `syncflush` (default) or `background`
//! - `ELASTIC_APM_LOG_LEVEL` - log verbosity
//!
//! See the crate documentation for the full list.

use anyhow::{Context, Result};
use apm_lambda_extension::{Config, ExtensionRuntime};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging().context("could not install the log subscriber")?;

    let config = Config::load().context("invalid ELASTIC_APM_* environment")?;
    tracing::debug!(?config, "Configuration loaded");

    ExtensionRuntime::new(config)
        .run()
        .await
        .context("APM extension exited with an error")?;

    Ok(())
}

/// Logs go to stderr without timestamps; the Lambda log stream stamps every
/// line itself. `ELASTIC_APM_LOG_LEVEL` wins over `RUST_LOG`.
fn init_logging() -> Result<()> {
    let filter = std::env::var("ELASTIC_APM_LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).without_time())
        .try_init()
        .context("a global log subscriber is already set")?;

    Ok(())
}
