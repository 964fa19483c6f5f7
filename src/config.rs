//! Configuration module for the pipecho server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::SizePolicy;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "pipecho")]
#[command(author = "pipecho authors")]
#[command(version = "0.1.0")]
#[command(about = "A pipelined TCP echo server with optional TLS", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Serve over TLS
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate chain (a self-signed certificate is generated if omitted)
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Seconds to wait for connections to drain on shutdown
    #[arg(long)]
    pub shutdown_grace: Option<u64>,

    /// Log every chunk read and written
    #[arg(long)]
    pub log_traffic: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Stop reading from a connection once this many bytes wait to be written
    #[serde(default = "default_write_high_watermark")]
    pub write_high_watermark: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: None,
            shutdown_grace: default_shutdown_grace(),
            read_buffer_size: default_read_buffer_size(),
            write_high_watermark: default_write_high_watermark(),
            max_connections: default_max_connections(),
        }
    }
}

/// TLS configuration
#[derive(Debug, Deserialize, Default)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log every chunk read and written
    #[serde(default)]
    pub traffic: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            traffic: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8007
}

fn default_backlog() -> u32 {
    100
}

fn default_shutdown_grace() -> u64 {
    5 // seconds
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_write_high_watermark() -> usize {
    1024 * 1024 // 1 MB
}

fn default_max_connections() -> usize {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once the server starts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub backlog: u32,
    pub workers: Option<usize>,
    pub shutdown_grace: Duration,
    pub read_buffer_size: usize,
    pub write_high_watermark: usize,
    pub max_connections: usize,
    pub log_traffic: bool,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
}

impl ServerConfig {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        ServerConfig {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            tls: cli.tls || toml_config.tls.enabled,
            cert: cli.cert.or(toml_config.tls.cert),
            key: cli.key.or(toml_config.tls.key),
            backlog: cli.backlog.unwrap_or(server.backlog),
            workers: cli.workers.or(server.workers),
            shutdown_grace: Duration::from_secs(
                cli.shutdown_grace.unwrap_or(server.shutdown_grace),
            ),
            read_buffer_size: server.read_buffer_size,
            write_high_watermark: server.write_high_watermark,
            max_connections: server.max_connections,
            log_traffic: cli.log_traffic || toml_config.logging.traffic,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be between 1 and 65535".into()));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive".into()));
        }
        if self.write_high_watermark == 0 {
            return Err(ConfigError::Invalid(
                "write_high_watermark must be positive".into(),
            ));
        }
        if self.cert.is_some() != self.key.is_some() {
            return Err(ConfigError::Invalid(
                "cert and key must be given together".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn size_policy(&self) -> SizePolicy {
        match self.workers {
            Some(n) => SizePolicy::Fixed(n),
            None => SizePolicy::AvailableParallelism,
        }
    }
}

impl CliArgs {
    /// Arguments as if none were given on the command line.
    fn empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            tls: false,
            cert: None,
            key: None,
            backlog: None,
            workers: None,
            shutdown_grace: None,
            log_traffic: false,
            log_level: "info".to_string(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8007);
        assert!(!config.tls);
        assert_eq!(config.backlog, 100);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.size_policy(), SizePolicy::AvailableParallelism);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9007
            backlog = 512
            workers = 4
            shutdown_grace = 2

            [tls]
            enabled = true
            cert = "/etc/pipecho/cert.pem"
            key = "/etc/pipecho/key.pem"

            [logging]
            level = "debug"
            traffic = true
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = ServerConfig::merge(CliArgs::empty(), toml_config);
        assert_eq!(config.listen_addr(), "127.0.0.1:9007");
        assert_eq!(config.backlog, 512);
        assert_eq!(config.size_policy(), SizePolicy::Fixed(4));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert!(config.tls);
        assert_eq!(config.cert, Some(PathBuf::from("/etc/pipecho/cert.pem")));
        assert!(config.log_traffic);
        assert_eq!(config.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[server]\nport = 9007\n").unwrap();
        let cli = CliArgs::parse_from(["pipecho", "--port", "7000", "--tls", "-w", "2"]);
        let config = ServerConfig::merge(cli, toml_config);
        assert_eq!(config.port, 7000);
        assert!(config.tls);
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn test_validation() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = ServerConfig {
            workers: Some(0),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            write_high_watermark: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            cert: Some(PathBuf::from("cert.pem")),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
