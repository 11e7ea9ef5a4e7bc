//! Configuration module for charfinder-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::index::IndexSource;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the character finder server
#[derive(Parser, Debug)]
#[command(name = "charfinder-server")]
#[command(author = "charfinder-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Find Unicode characters by name over a line protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on (0 picks an ephemeral port)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// UnicodeData.txt file to build the index from (defaults to the builtin table)
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Extra delay in milliseconds after the index is built, before it is published
    #[arg(long)]
    pub warmup_ms: Option<u64>,

    /// Number of runtime worker threads (1 = single-threaded event loop)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds to wait for open connections on shutdown (0 = wait for all)
    #[arg(long)]
    pub drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of runtime worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait for open connections on shutdown; 0 waits for all
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            max_connections: default_max_connections(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// Index-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct IndexConfig {
    /// UnicodeData.txt file; the builtin name table is used when absent
    pub data_file: Option<PathBuf>,
    /// Artificial load delay in milliseconds
    #[serde(default)]
    pub warmup_ms: u64,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2323
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    10_000
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub max_connections: usize,
    pub drain_timeout: Option<Duration>,
    pub index_source: IndexSource,
    pub warmup: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
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

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let data_file = cli.data_file.or(toml_config.index.data_file);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.unwrap_or(toml_config.server.workers).max(1),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections)
                .max(1),
            drain_timeout: match cli
                .drain_timeout
                .unwrap_or(toml_config.server.drain_timeout_secs)
            {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            index_source: match data_file {
                Some(path) => IndexSource::UnicodeData(path),
                None => IndexSource::Builtin,
            },
            warmup: Duration::from_millis(cli.warmup_ms.unwrap_or(toml_config.index.warmup_ms)),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Address string as given, for logging and bind errors.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl CliArgs {
    fn default_args() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            data_file: None,
            warmup_ms: None,
            workers: None,
            max_connections: None,
            drain_timeout: None,
            log_level: None,
        }
    }
}
