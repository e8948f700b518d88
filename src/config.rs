use std::{collections::BTreeMap, fs, path::Path, str::FromStr};

use anyhow::Context as _;
use serde::Deserialize;

const DEFAULT_APPLICATION_NAME: &str = "replaysql";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let config: Self = toml.parse()?;
        config
            .replay
            .command_error_level()
            .context("validate replay.command_error_log_level")?;
        Ok(config)
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    /// Connection string handed to the database driver.
    pub connection_string: String,
    /// Application name used when app-name mimicry is off or a command
    /// carries no application name.
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

fn default_application_name() -> String {
    DEFAULT_APPLICATION_NAME.to_string()
}

/// The replay engine's option surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Per-command timeout in seconds; 0 disables the timeout.
    pub query_timeout_s: u64,
    /// Bounded retry depth for non-timeout database errors.
    pub fail_retry_max: u32,
    /// Bounded retry depth for command timeouts.
    pub timeout_retry_max: u32,
    /// Rethrow instead of continuing after any execution failure.
    pub stop_on_error: bool,
    /// Use the captured command's application name on the connection.
    pub mimic_application_name: bool,
    /// Drain all result sets rather than executing non-query.
    pub consume_results: bool,
    /// Emit out-of-band tracing events on failure.
    pub raise_errors_to_tracing: bool,
    /// Emit periodic per-worker throughput samples.
    pub display_worker_stats: bool,
    /// Number of successful commands between two throughput samples.
    pub worker_stats_command_count: u64,
    /// Source database name to target database name.
    pub database_map: BTreeMap<String, String>,
    /// Severity used when logging command execution errors.
    pub command_error_log_level: String,
    /// Driver error codes recognized as command timeouts.
    pub timeout_error_codes: Vec<i32>,
    /// Workers idle longer than this are destroyed by the dispatcher.
    pub worker_idle_timeout_s: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            query_timeout_s: 600,
            fail_retry_max: 0,
            timeout_retry_max: 0,
            stop_on_error: false,
            mimic_application_name: false,
            consume_results: true,
            raise_errors_to_tracing: false,
            display_worker_stats: false,
            worker_stats_command_count: 1000,
            database_map: BTreeMap::new(),
            command_error_log_level: "error".to_string(),
            timeout_error_codes: vec![crate::driver::DEFAULT_TIMEOUT_ERROR_CODE],
            worker_idle_timeout_s: 300,
        }
    }
}

impl ReplayConfig {
    pub fn command_error_level(&self) -> anyhow::Result<tracing::Level> {
        self.command_error_log_level
            .trim()
            .to_ascii_lowercase()
            .parse::<tracing::Level>()
            .map_err(|_| {
                anyhow::anyhow!(
                    "invalid log level `{}`; expected one of trace, debug, info, warn, error",
                    self.command_error_log_level
                )
            })
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = Config::from_toml_str(
            r#"
[target]
connection_string = "host=localhost user=replay"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.target.application_name, "replaysql");
        assert_eq!(config.replay.query_timeout_s, 600);
        assert_eq!(config.replay.timeout_error_codes, vec![-2]);
        assert!(config.replay.consume_results);
        assert!(!config.replay.stop_on_error);
        assert!(config.replay.database_map.is_empty());
        assert_eq!(
            config.replay.command_error_level().expect("default level parses"),
            tracing::Level::ERROR
        );
    }

    #[test]
    fn full_replay_section_is_honored() {
        let config = Config::from_toml_str(
            r#"
[target]
connection_string = "host=db.example.com user=replay"
application_name = "replay-bench"

[replay]
query_timeout_s = 30
fail_retry_max = 2
timeout_retry_max = 1
stop_on_error = true
mimic_application_name = true
consume_results = false
raise_errors_to_tracing = true
display_worker_stats = true
worker_stats_command_count = 50
command_error_log_level = "warn"
timeout_error_codes = [-2, 57014]
worker_idle_timeout_s = 60

[replay.database_map]
prod = "prod_copy"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.replay.query_timeout_s, 30);
        assert_eq!(config.replay.fail_retry_max, 2);
        assert_eq!(config.replay.timeout_retry_max, 1);
        assert!(config.replay.stop_on_error);
        assert!(config.replay.mimic_application_name);
        assert!(!config.replay.consume_results);
        assert!(config.replay.raise_errors_to_tracing);
        assert_eq!(config.replay.worker_stats_command_count, 50);
        assert_eq!(config.replay.timeout_error_codes, vec![-2, 57014]);
        assert_eq!(config.replay.database_map["prod"], "prod_copy");
        assert_eq!(
            config.replay.command_error_level().expect("warn parses"),
            tracing::Level::WARN
        );
    }

    #[test]
    fn invalid_command_error_level_is_rejected() {
        let err = Config::from_toml_str(
            r#"
[target]
connection_string = "host=localhost"

[replay]
command_error_log_level = "loud"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("command_error_log_level"), "{err}");
    }

    #[test]
    fn missing_target_section_is_rejected() {
        assert!(Config::from_toml_str("[replay]\nstop_on_error = true\n").is_err());
    }
}
