//! Configuration module for the shout relay.
//!
//! The port comes from the command line. Everything else can be tuned through
//! an optional TOML file; CLI arguments take precedence over file values.

use clap::Parser;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "shout-relay")]
#[command(version)]
#[command(about = "Relays every message to all other peers, uppercased", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// What the relay does with a connection whose write fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteErrorPolicy {
    /// Drop the queued messages and keep the connection open.
    #[default]
    Discard,
    /// Drop the queued messages and close the connection.
    Close,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Maximum number of simultaneous peers
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Read buffer capacity; also the largest chunk broadcast per read
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Upper bound on one readiness wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Readiness events collected per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub write_error_policy: WriteErrorPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            event_capacity: default_event_capacity(),
            write_error_policy: WriteErrorPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_poll_timeout_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub poll_timeout: Duration,
    pub event_capacity: usize,
    pub write_error_policy: WriteErrorPolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::try_parse()?;
        Self::from_args(cli)
    }

    /// Resolve parsed CLI arguments against the TOML file they point at.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let host = server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(server.host.clone()))?;
        if server.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1"));
        }
        if server.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if server.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1"));
        }

        Ok(Config {
            host,
            port: cli.port,
            max_connections: server.max_connections,
            buffer_size: server.buffer_size,
            poll_timeout: Duration::from_millis(server.poll_timeout_ms.max(1)),
            event_capacity: server.event_capacity,
            write_error_policy: server.write_error_policy,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Usage(#[from] clap::Error),
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid host address '{0}'")]
    InvalidHost(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("shout-relay").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.server.write_error_policy, WriteErrorPolicy::Discard);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_port_bounds() {
        assert_eq!(cli(&["1"]).unwrap().port, 1);
        assert_eq!(cli(&["65535"]).unwrap().port, 65535);
        assert!(cli(&["0"]).is_err());
        assert!(cli(&["65536"]).is_err());
        assert!(cli(&["-5"]).is_err());
        assert!(cli(&["http"]).is_err());
        assert!(cli(&[]).is_err());
        assert!(cli(&["8080", "9090"]).is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            max_connections = 64
            buffer_size = 512
            poll_timeout_ms = 50
            write_error_policy = "close"

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.event_capacity, 1024);

        let config = Config::resolve(cli(&["7000"]).unwrap(), toml_config).unwrap();
        assert_eq!(config.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(config.port, 7000);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.write_error_policy, WriteErrorPolicy::Close);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_log_level_wins() {
        let args = cli(&["7000", "--log-level", "trace"]).unwrap();
        let config = Config::resolve(args, TomlConfig::default()).unwrap();
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut toml_config = TomlConfig::default();
        toml_config.server.host = "not-an-ip".to_string();
        assert!(matches!(
            Config::resolve(cli(&["7000"]).unwrap(), toml_config),
            Err(ConfigError::InvalidHost(_))
        ));

        let mut toml_config = TomlConfig::default();
        toml_config.server.buffer_size = 0;
        assert!(matches!(
            Config::resolve(cli(&["7000"]).unwrap(), toml_config),
            Err(ConfigError::Invalid(_))
        ));

        assert!(toml::from_str::<TomlConfig>("[server]\nwrite_error_policy = \"retry\"").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let args = cli(&["7000", "--config", "/nonexistent/shout-relay.toml"]).unwrap();
        assert!(matches!(
            Config::from_args(args),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
