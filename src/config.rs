//! Configuration module for the reactor pool server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::codec::CodecKind;
use crate::error::ConfigError;
use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::runtime::{AssignerStrategy, ControllerSettings};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "reactor-pool")]
#[command(version = "0.1.0")]
#[command(about = "Framed, compressed connections spread across selector controllers", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7575)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of selector controllers (defaults to number of CPU cores)
    #[arg(short = 'p', long)]
    pub pool_size: Option<usize>,

    /// Strategy used to place accepted connections on controllers
    #[arg(short = 'a', long, value_enum)]
    pub assigner: Option<AssignerStrategy>,

    /// Payload codec for accepted connections
    #[arg(long, value_enum)]
    pub codec: Option<CodecKind>,

    /// Largest frame payload accepted, in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Controller pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Number of selector controllers
    pub size: Option<usize>,
    #[serde(default)]
    pub assigner: AssignerStrategy,
    #[serde(default = "default_codec")]
    pub codec: CodecKind,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Bytes requested per read call
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Read calls per connection before yielding to the others
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
    /// Queued reply bytes above which a connection stops being read
    #[serde(default = "default_write_high_water")]
    pub write_high_water: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            assigner: AssignerStrategy::default(),
            codec: default_codec(),
            events_capacity: default_events_capacity(),
            max_frame_size: default_max_frame_size(),
            read_chunk: default_read_chunk(),
            read_budget: default_read_budget(),
            write_high_water: default_write_high_water(),
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
    "127.0.0.1:7575".to_string()
}

fn default_codec() -> CodecKind {
    CodecKind::Null
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_read_chunk() -> usize {
    16 * 1024 // 16 KB
}

fn default_read_budget() -> usize {
    16
}

fn default_write_high_water() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub pool_size: usize,
    pub assigner: AssignerStrategy,
    pub codec: CodecKind,
    pub controller: ControllerSettings,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge CLI args with the TOML file they name (CLI takes precedence).
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            pool_size: cli
                .pool_size
                .or(toml_config.pool.size)
                .unwrap_or_else(num_cpus),
            assigner: cli.assigner.unwrap_or(toml_config.pool.assigner),
            codec: cli.codec.unwrap_or(toml_config.pool.codec),
            controller: ControllerSettings {
                events_capacity: toml_config.pool.events_capacity,
                max_frame_size: cli
                    .max_frame_size
                    .unwrap_or(toml_config.pool.max_frame_size),
                read_chunk: toml_config.pool.read_chunk,
                read_budget: toml_config.pool.read_budget,
                write_high_water: toml_config.pool.write_high_water,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.pool_size));
        }
        self.controller.validate()?;
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
