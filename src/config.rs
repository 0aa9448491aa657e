//! Configuration loading and management.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Transport gateway connection.
    pub transport: TransportConfig,
    /// Web front end.
    pub site: SiteConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Transport gateway configuration.
///
/// The daemon does not speak the federated wire protocol itself; it connects
/// to a protocol gateway over a local socket and exchanges JSON lines with
/// it. See `transport::bridge`.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Address of the protocol gateway (e.g. "127.0.0.1:5347").
    pub gateway_addr: SocketAddr,
    /// Liveness no-op interval in seconds (default: 30).
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// Web front end configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Address to serve HTTP on (default: 0.0.0.0:8083).
    #[serde(default = "default_site_bind")]
    pub bind: SocketAddr,
    /// Absolute base URL embedded in registration links and icon URLs.
    /// Must end with a trailing slash.
    pub base_url: String,
    /// Directory holding static assets (status icons under img/icons/).
    #[serde(default = "default_public_dir")]
    pub public_dir: String,
}

impl SiteConfig {
    /// URL of the status icon for the given icon name.
    pub fn icon_url(&self, icon: &str) -> String {
        format!("{}img/icons/{}.png", self.base_url, icon)
    }

    /// Deep link to the account page for the given code.
    pub fn account_url(&self, code: &str) -> String {
        format!("{}account/{}", self.base_url, code)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file, or ":memory:".
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_site_bind() -> SocketAddr {
    ([0, 0, 0, 0], 8083).into()
}

fn default_public_dir() -> String {
    "public".to_string()
}

fn default_db_path() -> String {
    "mystatus.db".to_string()
}
