use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Installs the global tracing subscriber. The level comes from the CLI
/// override when given, then the `[logging]` config section, then the
/// default; the format defaults to JSON.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let (level, format) = resolve(config, cli_level_override)?;

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<(LevelFilter, LogFormat)> {
    let logging = config.logging.as_ref();
    let raw_level = cli_level_override
        .or_else(|| logging.and_then(|logging| logging.level.as_deref()))
        .unwrap_or(DEFAULT_LOG_LEVEL);

    let level = raw_level
        .trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!(
                "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
            )
        })?;
    let format = logging
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json);

    Ok((level, format))
}
