//! Client configuration loading.
//!
//! The master endpoint comes from `FEL_MASTER_ADDR` / `FEL_MASTER_PORT`
//! (absent → `127.0.0.1:16667`).  An optional TOML file named by
//! `FEL_CLIENT_CONFIG` supplies the remaining knobs; environment variables
//! win over the file for the master endpoint.
//!
//! # File format
//! ```toml
//! heart_beat_duration_ms = 1000
//! connect_timeout_ms = 10000
//!
//! [master]
//! addr = "192.168.1.20"
//! port = 16667
//! ```

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

pub const DEFAULT_MASTER_PORT: u16 = 16667;
pub const DEFAULT_HEART_BEAT_DURATION_MS: u64 = 1000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Fully resolved client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub master_addr: SocketAddr,
    pub heart_beat_duration_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            master_addr: SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_MASTER_PORT),
            heart_beat_duration_ms: DEFAULT_HEART_BEAT_DURATION_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    heart_beat_duration_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    master: Option<RawMasterConfig>,
}

#[derive(Debug, Deserialize)]
struct RawMasterConfig {
    addr: Option<String>,
    port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Resolve the configuration from the process environment, consulting the
/// optional TOML file named by `FEL_CLIENT_CONFIG`.
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    let file = match std::env::var("FEL_CLIENT_CONFIG") {
        Ok(path) => Some(load_file(Path::new(&path))?),
        Err(_) => None,
    };
    resolve(
        file,
        std::env::var("FEL_MASTER_ADDR").ok(),
        std::env::var("FEL_MASTER_PORT").ok(),
    )
}

fn load_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
}

fn resolve(
    file: Option<RawConfig>,
    env_addr: Option<String>,
    env_port: Option<String>,
) -> Result<ClientConfig, ConfigError> {
    let defaults = ClientConfig::default();
    let raw_master = file.as_ref().and_then(|f| f.master.as_ref());

    let host = env_addr
        .or_else(|| raw_master.and_then(|m| m.addr.clone()))
        .unwrap_or_else(|| "127.0.0.1".to_owned());
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ConfigError::InvalidAddr(host.clone()))?;

    let port = match env_port {
        Some(text) => text
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(text))?,
        None => raw_master
            .and_then(|m| m.port)
            .unwrap_or(DEFAULT_MASTER_PORT),
    };

    Ok(ClientConfig {
        master_addr: SocketAddr::new(ip, port),
        heart_beat_duration_ms: file
            .as_ref()
            .and_then(|f| f.heart_beat_duration_ms)
            .unwrap_or(defaults.heart_beat_duration_ms),
        connect_timeout_ms: file
            .as_ref()
            .and_then(|f| f.connect_timeout_ms)
            .unwrap_or(defaults.connect_timeout_ms),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config file invalid: {0}")]
    Parse(String),
    #[error("invalid master address: {0}")]
    InvalidAddr(String),
    #[error("invalid master port: {0}")]
    InvalidPort(String),
}
