//! Configuration module for line-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::protocol::MAX_NAME_LEN;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded TCP message relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub mode: Mode,
}

/// Process mode
#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the relay server
    Server {
        /// Address to bind to (e.g., 0.0.0.0:1998)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Maximum number of simultaneous connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Maximum size of a single message frame in bytes
        #[arg(long)]
        max_frame_size: Option<usize>,

        /// What to do when a name is already taken
        #[arg(long, value_enum)]
        name_policy: Option<NamePolicy>,
    },
    /// Connect to a relay as an interactive client
    Client {
        /// Server host name or address
        host: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// User name (prompted for when absent)
        #[arg(short, long)]
        name: Option<String>,
    },
}

/// Handling of a registration for a name another live connection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NamePolicy {
    /// Tear down the late registrant; the holder keeps the name.
    Reject,
    /// Give the name to the late registrant; tear down the holder.
    Replace,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Poll timeout in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Interval between stats log lines in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    /// Duplicate name handling
    #[serde(default = "default_name_policy")]
    pub name_policy: NamePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            poll_timeout_ms: default_poll_timeout_ms(),
            stats_interval: default_stats_interval(),
            name_policy: default_name_policy(),
        }
    }
}

/// Resource limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Bytes queued for a slow recipient before it is disconnected
    #[serde(default = "default_max_pending_output")]
    pub max_pending_output: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_pending_output: default_max_pending_output(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
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

fn default_listen() -> String {
    format!("0.0.0.0:{}", default_port())
}

fn default_port() -> u16 {
    1998
}

fn default_backlog() -> i32 {
    128
}

fn default_poll_timeout_ms() -> u64 {
    50
}

fn default_stats_interval() -> u64 {
    60
}

fn default_name_policy() -> NamePolicy {
    NamePolicy::Reject
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_pending_output() -> usize {
    1024 * 1024 // 1 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub max_pending_output: usize,
    pub poll_timeout: Duration,
    pub stats_interval: Duration,
    pub name_policy: NamePolicy,
    pub log_level: String,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub log_level: String,
}

/// What the process was asked to run.
#[derive(Debug, Clone)]
pub enum Launch {
    Server(Config),
    Client(ClientConfig),
}

impl Launch {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level
        };

        match cli.mode {
            Mode::Server {
                listen,
                max_connections,
                max_frame_size,
                name_policy,
            } => {
                let config = Config {
                    listen: listen.unwrap_or(toml_config.server.listen),
                    backlog: toml_config.server.backlog,
                    max_connections: max_connections
                        .unwrap_or(toml_config.limits.max_connections),
                    max_frame_size: max_frame_size.unwrap_or(toml_config.limits.max_frame_size),
                    max_pending_output: toml_config.limits.max_pending_output,
                    poll_timeout: Duration::from_millis(toml_config.server.poll_timeout_ms),
                    stats_interval: Duration::from_secs(toml_config.server.stats_interval),
                    name_policy: name_policy.unwrap_or(toml_config.server.name_policy),
                    log_level,
                };
                config.validate()?;
                Ok(Launch::Server(config))
            }
            Mode::Client { host, port, name } => Ok(Launch::Client(ClientConfig {
                host,
                port: port.unwrap_or(toml_config.client.port),
                name,
                log_level,
            })),
        }
    }

    pub fn log_level(&self) -> &str {
        match self {
            Launch::Server(config) => &config.log_level,
            Launch::Client(config) => &config.log_level,
        }
    }
}

impl Config {
    /// Smallest frame limit that still admits a maximal name plus delimiters.
    pub const MIN_FRAME_SIZE: usize = MAX_NAME_LEN + 3;

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < Self::MIN_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {}",
                Self::MIN_FRAME_SIZE
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be non-zero".to_string(),
            ));
        }
        if self.max_pending_output == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_output must be non-zero".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive".to_string()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
