//! Remote accessibility relay, entry point.
//!
//! Accepts TCP connections from controller and controlled clients, pairs
//! them by channel key, and forwards each client's records to the rest of
//! its channel.
//!
//! # Usage
//!
//! ```text
//! remote-relay [OPTIONS]
//!
//! Options:
//!   --bind  <ADDR>                IP address to listen on [default: 0.0.0.0]
//!   --port  <PORT>                TCP port [default: 6837]
//!   --protocol-version <N>        Version clients must announce [default: 2]
//!   --send-queue-capacity <N>     Records queued per client [default: 1024]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                   | Default   | Description             |
//! |----------------------------|-----------|-------------------------|
//! | `REMOTE_RELAY_BIND`        | `0.0.0.0` | Listener IP address     |
//! | `REMOTE_RELAY_PORT`        | `6837`    | Listener port           |
//! | `REMOTE_RELAY_QUEUE`       | `1024`    | Per-client queue length |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remote_core::PROTOCOL_VERSION;
use remote_relay::domain::config::DEFAULT_PORT;
use remote_relay::domain::RelayConfig;
use remote_relay::infrastructure::run_server;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "remote-relay",
    about = "Channel relay for remote accessibility sessions",
    version
)]
struct Cli {
    /// IP address to bind the listener to.
    ///
    /// `0.0.0.0` accepts connections on every interface; `127.0.0.1` only
    /// from this machine.
    #[arg(long, default_value = "0.0.0.0", env = "REMOTE_RELAY_BIND")]
    bind: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "REMOTE_RELAY_PORT")]
    port: u16,

    /// Protocol version clients must announce.
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    protocol_version: u32,

    /// Records queued per client before further records to it are dropped.
    #[arg(long, default_value_t = 1024, env = "REMOTE_RELAY_QUEUE")]
    send_queue_capacity: usize,
}

impl Cli {
    /// Converts the parsed arguments into a [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not an IP address.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let ip: IpAddr = self
            .bind
            .parse()
            .with_context(|| format!("invalid bind address: '{}'", self.bind))?;

        Ok(RelayConfig {
            bind_addr: SocketAddr::new(ip, self.port),
            protocol_version: self.protocol_version,
            send_queue_capacity: self.send_queue_capacity.max(1),
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_relay_config()?;
    info!(
        "remote relay starting on {} (protocol {})",
        config.bind_addr, config.protocol_version
    );

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    run_server(config, running).await?;

    info!("remote relay stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_match_relay_config_defaults() {
        // Arrange
        let cli = Cli::parse_from(["remote-relay"]);

        // Act
        let config = cli.into_relay_config().unwrap();

        // Assert
        let defaults = RelayConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.protocol_version, defaults.protocol_version);
        assert_eq!(config.send_queue_capacity, defaults.send_queue_capacity);
    }

    #[test]
    fn test_cli_port_and_bind_override() {
        let cli = Cli::parse_from(["remote-relay", "--bind", "127.0.0.1", "--port", "7000"]);
        let config = cli.into_relay_config().unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7000");
    }

    #[test]
    fn test_cli_accepts_ipv6_bind() {
        let cli = Cli::parse_from(["remote-relay", "--bind", "::1", "--port", "7000"]);
        let config = cli.into_relay_config().unwrap();
        assert!(config.bind_addr.is_ipv6());
    }

    #[test]
    fn test_zero_queue_capacity_is_raised_to_one() {
        let cli = Cli::parse_from(["remote-relay", "--send-queue-capacity", "0"]);
        let config = cli.into_relay_config().unwrap();
        assert_eq!(config.send_queue_capacity, 1);
    }

    #[test]
    fn test_invalid_bind_returns_error() {
        // Arrange
        let cli = Cli {
            bind: "not.an.ip".to_string(),
            port: DEFAULT_PORT,
            protocol_version: PROTOCOL_VERSION,
            send_queue_capacity: 1024,
        };

        // Act
        let result = cli.into_relay_config();

        // Assert
        assert!(result.is_err());
    }
}
