use crate::config::AppConfig;
use crate::config::tracing::Format;
use crate::error::ErrandResult;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global `tracing` subscriber using the app's [`crate::config::tracing::Tracing`]
/// config. Can only be called once per process.
pub fn init_tracing(app_config: &AppConfig) -> ErrandResult<()> {
    let env_filter = env_filter(app_config)?;

    // Stdout Layer
    let stdout_layer = match app_config.tracing.format {
        Format::None => None,
        Format::Pretty => Some(tracing_subscriber::fmt::layer().pretty().boxed()),
        Format::Compact => Some(tracing_subscriber::fmt::layer().compact().boxed()),
        Format::Json => Some(tracing_subscriber::fmt::layer().json().boxed()),
    };

    tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))?;

    Ok(())
}

fn env_filter(app_config: &AppConfig) -> ErrandResult<EnvFilter> {
    let level = Level::from_str(&app_config.tracing.level).map_err(|err| anyhow::anyhow!(err))?;

    let env_filter = app_config.tracing.trace_filters.iter().try_fold(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()
            .map_err(|err| anyhow::anyhow!(err))?,
        |env_filter, directive| -> ErrandResult<EnvFilter> {
            let directive = directive.parse().map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(env_filter.add_directive(directive))
        },
    )?;

    Ok(env_filter)
}
