//! Startup configuration: command line, TOML file and defaults.
//!
//! Precedence is command line (or its `STOCKD_*` environment fallback) over
//! the configuration file over built-in defaults. Only the tunables are
//! reloadable; bind address and logging are fixed at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::network::{ConnectionConfig, NetworkConfig};
use crate::service::config::{DatabaseConfig, Tunables};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `stockd` command line.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "stockd", version, about = "Inventory reservation server")]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(short = 'f', long = "config", env = "STOCKD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address, overrides `general.host`.
    #[arg(long, env = "STOCKD_HOST")]
    pub host: Option<String>,

    /// Listen port, overrides `general.port`.
    #[arg(short, long, env = "STOCKD_PORT")]
    pub port: Option<u16>,

    /// Listen backlog, overrides `general.backlog`. Values <= 0 use the OS maximum.
    #[arg(long, env = "STOCKD_BACKLOG", allow_negative_numbers = true)]
    pub backlog: Option<i32>,

    #[arg(long, value_enum, env = "STOCKD_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// On-disk configuration. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub general: GeneralSection,
    pub expiration: ExpirationSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralSection {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub workers: usize,
    pub scale_down_interval_ms: u64,
    pub max_line_bytes: usize,
    pub log_level: String,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2000,
            backlog: 0,
            workers: 500,
            scale_down_interval_ms: 30_000,
            max_line_bytes: 64 * 1024,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpirationSection {
    pub ttl_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ExpirationSection {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            cleanup_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    pub persistence: bool,
    pub file: PathBuf,
    pub autosave_interval_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        let db = DatabaseConfig::default();
        Self {
            persistence: db.persistence,
            file: db.file,
            autosave_interval_secs: db.autosave_interval.as_secs(),
        }
    }
}

impl FileConfig {
    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not valid configuration.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    ///
    /// Fails on malformed TOML or unknown keys.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Extracts the reloadable subset.
    #[must_use]
    pub fn tunables(&self) -> Tunables {
        Tunables {
            ttl: Duration::from_secs(self.expiration.ttl_secs),
            // A zero interval would spin the reaper.
            cleanup_interval: Duration::from_secs(self.expiration.cleanup_interval_secs.max(1)),
            max_workers: self.general.workers,
            scale_down_interval: Duration::from_millis(self.general.scale_down_interval_ms.max(1)),
            max_line_bytes: self.general.max_line_bytes.max(1),
            database: DatabaseConfig {
                persistence: self.database.persistence,
                file: self.database.file.clone(),
                autosave_interval: Duration::from_secs(self.database.autosave_interval_secs),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub tunables: Tunables,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Where configuration comes from. Kept by the server so a reload re-reads
/// the same file and re-applies the same command-line overrides.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub path: Option<PathBuf>,
    pub overrides: CliArgs,
}

impl ConfigSource {
    #[must_use]
    pub fn from_args(args: CliArgs) -> Self {
        Self {
            path: args.config.clone(),
            overrides: args,
        }
    }

    /// Built-in defaults plus command-line overrides, no file.
    #[must_use]
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Resolves the effective configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configured file cannot be read or parsed.
    pub fn load(&self) -> anyhow::Result<ServerConfig> {
        let file = match &self.path {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };

        let args = &self.overrides;
        let backlog = args.backlog.unwrap_or(file.general.backlog);

        Ok(ServerConfig {
            network: NetworkConfig {
                host: args.host.clone().unwrap_or_else(|| file.general.host.clone()),
                port: args.port.unwrap_or(file.general.port),
                backlog: NetworkConfig::backlog_from(backlog),
                connection: ConnectionConfig::default(),
                ..NetworkConfig::default()
            },
            tunables: file.tunables(),
            log_level: file.general.log_level.clone(),
            log_format: args.log_format,
        })
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        ConfigSource::from_args(args).load()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
