//! TOML configuration for the client binary.
//!
//! ```toml
//! [connection]
//! host = "relay.example.org"
//! port = 6837
//! role = "controller"
//! channel = "4429117"
//!
//! [session]
//! muted = false
//!
//! [logging]
//! log_level = "debug"
//! ```
//!
//! Every field is optional.  A missing file is not an error: the defaults
//! below connect to a relay on `127.0.0.1:6837` as the controlled side and
//! ask the relay to generate a channel key.

use std::path::{Path, PathBuf};
use std::time::Duration;

use remote_core::{ChannelToken, ConnectionType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infrastructure::transport::tcp::TcpTransportConfig;
use crate::infrastructure::transport::{
    TransportOptions, DEFAULT_RECONNECT_DELAY, DEFAULT_SEND_QUEUE_CAPACITY,
};

/// Port relays listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 6837;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where to connect and in which role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_role")]
    pub role: ConnectionType,
    /// Channel key shared with the peer.  When absent the relay is asked to
    /// generate one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Controller only: how often the synthesizer index is polled.
    #[serde(default = "default_index_poll_interval_ms")]
    pub index_poll_interval_ms: u64,
    /// Controller only: start with remote speech silenced.
    #[serde(default)]
    pub muted: bool,
    /// Size of the pretend braille display of the console host.  Zero means
    /// no display.
    #[serde(default)]
    pub braille_cells: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` level or filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_role() -> ConnectionType {
    ConnectionType::Controlled
}
fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY.as_secs()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_send_queue_capacity() -> usize {
    DEFAULT_SEND_QUEUE_CAPACITY
}
fn default_index_poll_interval_ms() -> u64 {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            role: default_role(),
            channel: None,
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            send_queue_capacity: default_send_queue_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            index_poll_interval_ms: default_index_poll_interval_ms(),
            muted: false,
            braille_cells: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl SessionConfig {
    /// Index poll period, never shorter than a millisecond.
    pub fn index_poll_interval(&self) -> Duration {
        Duration::from_millis(self.index_poll_interval_ms.max(1))
    }
}

impl ConnectionConfig {
    /// `host:port`, bracketing bare IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The configured channel, ignoring an empty string.
    pub fn channel_token(&self) -> Option<ChannelToken> {
        self.channel
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ChannelToken::from)
    }

    /// Transport settings, with zero timeouts and delays raised to one second.
    pub fn tcp_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            address: self.address(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            options: TransportOptions {
                reconnect_delay: Duration::from_secs(self.reconnect_delay_secs.max(1)),
                send_queue_capacity: self.send_queue_capacity.max(1),
            },
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// The per-user config file used when `--config` is not given:
/// - Windows:  `%APPDATA%\RemoteAccess\client.toml`
/// - Linux:    `$XDG_CONFIG_HOME/remote-access/client.toml` (or `~/.config/...`)
/// - macOS:    `~/Library/Application Support/RemoteAccess/client.toml`
pub fn default_config_path() -> Option<PathBuf> {
    platform_config_dir().map(|dir| dir.join("client.toml"))
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("RemoteAccess"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("remote-access"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("RemoteAccess")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

/// Parses a config from TOML text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<ClientConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Loads the config at `path`, returning `ClientConfig::default()` if no path
/// is given or the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(ClientConfig::default());
    };

    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ClientConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
