//! Tracing initialization for the worker binaries.

use anyhow::Context;
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// `LOG_LEVEL` so operators can turn up one target without redeploying.
pub fn init(default_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("invalid LOG_LEVEL '{default_level}'"))?;

    let base = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stdout);

    match format {
        LogFormat::Plain => base.init(),
        LogFormat::Json => base.json().init(),
    }
    Ok(())
}
