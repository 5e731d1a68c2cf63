use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,outreach_worker=debug";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = Registry::default().with(env_filter);

    let installed = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(false)),
        ),
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(false)))
        }
    };
    installed.map_err(|e| anyhow!("failed to set global subscriber: {e}"))?;

    tracing::info!(format = ?format, "Tracing initialized");
    Ok(())
}
