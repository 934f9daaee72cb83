//! Configuration management for Vesta server
//!
//! Sources, lowest precedence first: built-in defaults, `conf/application.yml`,
//! `VESTA_*` environment variables (`__` separates nested keys), command line.

use std::time::Duration;

use clap::Parser;
use config::{Config, Environment};
use tracing::Level;

use vesta_config::cache::DEFAULT_REFRESH_INTERVAL_MS;
use vesta_config::service::release::DEFAULT_MAX_CONTENT_LENGTH;
use vesta_config::watch::{DEFAULT_WATCH_TIMEOUT_MS, MAX_WATCH_TIMEOUT_MS};
use vesta_config::{ReleaseCacheConfig, ReleaseServiceConfig, WatchCenterConfig};

use crate::startup::LoggingConfig;

pub const SERVER_ADDRESS: &str = "server.address";
pub const SERVER_PORT: &str = "server.port";
pub const SERVER_SHUTDOWN_TIMEOUT_SECS: &str = "server.shutdown_timeout_secs";
pub const CACHE_REFRESH_INTERVAL_MS: &str = "config.cache.refresh_interval_ms";
pub const CACHE_CONTENT_PATH: &str = "config.cache.content_path";
pub const WATCH_DEFAULT_TIMEOUT_MS: &str = "config.watch.default_timeout_ms";
pub const WATCH_MAX_TIMEOUT_MS: &str = "config.watch.max_timeout_ms";
pub const MAX_CONTENT_LENGTH: &str = "config.max_content_length";
pub const LOGS_PATH: &str = "logs.path";
pub const LOGS_CONSOLE: &str = "logs.console";
pub const LOGS_FILE: &str = "logs.file";
pub const LOGS_LEVEL: &str = "logs.level";

pub const DEFAULT_SERVER_PORT: u16 = 8090;
pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "vesta-server", about = "Configuration release engine server")]
struct Cli {
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    #[arg(long = "content-path")]
    content_path: Option<String>,
    #[arg(long = "log-dir")]
    log_dir: Option<String>,
}

/// Application configuration loaded from defaults, file, environment and CLI
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new() -> anyhow::Result<Self> {
        Self::build(Cli::parse())
    }

    /// Parse an explicit argument list instead of the process arguments
    pub fn from_args<I, T>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::build(Cli::try_parse_from(args)?)
    }

    fn build(args: Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .set_default(SERVER_ADDRESS, "0.0.0.0")?
            .set_default(SERVER_PORT, i64::from(DEFAULT_SERVER_PORT))?
            .set_default(SERVER_SHUTDOWN_TIMEOUT_SECS, 10)?
            .set_default(CACHE_REFRESH_INTERVAL_MS, DEFAULT_REFRESH_INTERVAL_MS)?
            .set_default(CACHE_CONTENT_PATH, "data/release-content")?
            .set_default(WATCH_DEFAULT_TIMEOUT_MS, DEFAULT_WATCH_TIMEOUT_MS)?
            .set_default(WATCH_MAX_TIMEOUT_MS, MAX_WATCH_TIMEOUT_MS)?
            .set_default(MAX_CONTENT_LENGTH, DEFAULT_MAX_CONTENT_LENGTH as u64)?
            .set_default(LOGS_PATH, "logs")?
            .set_default(LOGS_CONSOLE, true)?
            .set_default(LOGS_FILE, true)?
            .set_default(LOGS_LEVEL, "info")?
            .add_source(config::File::with_name(&args.config_file).required(false))
            .add_source(
                Environment::with_prefix("VESTA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(port) = args.port {
            builder = builder.set_override(SERVER_PORT, i64::from(port))?;
        }
        if let Some(path) = args.content_path {
            builder = builder.set_override(CACHE_CONTENT_PATH, path)?;
        }
        if let Some(dir) = args.log_dir {
            builder = builder.set_override(LOGS_PATH, dir)?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    // ========================================================================
    // Server
    // ========================================================================

    pub fn server_address(&self) -> String {
        self.config
            .get_string(SERVER_ADDRESS)
            .unwrap_or("0.0.0.0".to_string())
    }

    pub fn server_port(&self) -> u16 {
        self.config
            .get_int(SERVER_PORT)
            .ok()
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(DEFAULT_SERVER_PORT)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.u64_or(SERVER_SHUTDOWN_TIMEOUT_SECS, 10))
    }

    // ========================================================================
    // Release engine
    // ========================================================================

    pub fn cache_config(&self) -> ReleaseCacheConfig {
        ReleaseCacheConfig {
            refresh_interval: Duration::from_millis(
                self.u64_or(CACHE_REFRESH_INTERVAL_MS, DEFAULT_REFRESH_INTERVAL_MS),
            ),
        }
    }

    pub fn content_path(&self) -> String {
        self.config
            .get_string(CACHE_CONTENT_PATH)
            .unwrap_or("data/release-content".to_string())
    }

    pub fn watch_config(&self) -> WatchCenterConfig {
        WatchCenterConfig {
            default_timeout: Duration::from_millis(
                self.u64_or(WATCH_DEFAULT_TIMEOUT_MS, DEFAULT_WATCH_TIMEOUT_MS),
            ),
            max_timeout: Duration::from_millis(
                self.u64_or(WATCH_MAX_TIMEOUT_MS, MAX_WATCH_TIMEOUT_MS),
            ),
        }
    }

    pub fn release_service_config(&self) -> ReleaseServiceConfig {
        ReleaseServiceConfig {
            max_content_length: self
                .u64_or(MAX_CONTENT_LENGTH, DEFAULT_MAX_CONTENT_LENGTH as u64)
                as usize,
        }
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        let level = self
            .config
            .get_string(LOGS_LEVEL)
            .ok()
            .and_then(|v| v.parse::<Level>().ok())
            .unwrap_or(Level::INFO);
        LoggingConfig {
            log_dir: self
                .config
                .get_string(LOGS_PATH)
                .unwrap_or("logs".to_string())
                .into(),
            console_output: self.config.get_bool(LOGS_CONSOLE).unwrap_or(true),
            file_logging: self.config.get_bool(LOGS_FILE).unwrap_or(true),
            level,
            ..LoggingConfig::default()
        }
    }

    fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.config
            .get_int(key)
            .ok()
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(args: &[&str]) -> Configuration {
        let mut argv = vec!["vesta-server", "--config", "does/not/exist.yml"];
        argv.extend_from_slice(args);
        Configuration::from_args(argv).unwrap()
    }

    #[test]
    fn test_defaults_without_file() {
        let configuration = configuration(&[]);
        assert_eq!(configuration.server_port(), DEFAULT_SERVER_PORT);
        assert_eq!(configuration.server_address(), "0.0.0.0");
        assert_eq!(
            configuration.watch_config().default_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(
            configuration.watch_config().max_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            configuration.release_service_config().max_content_length,
            DEFAULT_MAX_CONTENT_LENGTH
        );
        assert_eq!(
            configuration.cache_config().refresh_interval,
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_cli_overrides() {
        let configuration = configuration(&[
            "--port",
            "9100",
            "--content-path",
            "/tmp/content",
            "--log-dir",
            "/tmp/vesta-logs",
        ]);
        assert_eq!(configuration.server_port(), 9100);
        assert_eq!(configuration.content_path(), "/tmp/content");
        assert_eq!(
            configuration.logging_config().log_dir,
            std::path::PathBuf::from("/tmp/vesta-logs")
        );
    }

    #[test]
    fn test_file_values_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.yml");
        std::fs::write(
            &path,
            "server:\n  port: 9200\nconfig:\n  watch:\n    default_timeout_ms: 5000\nlogs:\n  level: debug\n",
        )
        .unwrap();

        let configuration =
            Configuration::from_args(["vesta-server", "--config", path.to_str().unwrap()])
                .unwrap();
        assert_eq!(configuration.server_port(), 9200);
        assert_eq!(
            configuration.watch_config().default_timeout,
            Duration::from_secs(5)
        );
        assert_eq!(configuration.logging_config().level, Level::DEBUG);
    }
}
