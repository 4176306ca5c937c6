//! Remote accessibility client entry point.
//!
//! Connects to a relay, joins (or asks the relay to generate) a channel and
//! runs the session for the configured role against a console host that
//! logs everything the session asks of it.
//!
//! # Usage
//!
//! ```text
//! remote-client [OPTIONS]
//!
//! Options:
//!   --config  <PATH>   TOML config file
//!   --host    <HOST>   Relay hostname or IP
//!   --port    <PORT>   Relay port
//!   --role    <ROLE>   controller | controlled
//!   --channel <KEY>    Channel key; omitted means "generate one"
//!   --muted            Controller: start with remote speech silenced
//! ```
//!
//! Command-line values override the config file, which overrides the
//! built-in defaults.  Each option can also be given through the
//! environment variable listed in `--help`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use remote_client::application::local_events::LocalEventSource;
use remote_client::application::session::controller::ControllerOptions;
use remote_client::application::session::{ControlledSession, ControllerSession, SessionLink};
use remote_client::infrastructure::local_events::console::ConsoleEventSource;
use remote_client::infrastructure::storage::config::{
    default_config_path, load_config, ClientConfig,
};
use remote_client::infrastructure::transport::relay::RelayTransport;
use remote_client::infrastructure::transport::Transport;
use remote_core::protocol::messages::ChannelJoined;
use remote_core::{callback, ConnectionType, MessageType};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "remote-client",
    about = "Controller or controlled endpoint of a remote accessibility session",
    version
)]
struct Cli {
    /// TOML config file.  Defaults to the per-user config directory; a
    /// missing file means "use defaults".
    #[arg(long, env = "REMOTE_CONFIG")]
    config: Option<PathBuf>,

    /// Relay hostname or IP address.
    #[arg(long, env = "REMOTE_HOST")]
    host: Option<String>,

    /// Relay TCP port.
    #[arg(long, env = "REMOTE_PORT")]
    port: Option<u16>,

    /// Which side of the session this machine is.
    #[arg(long, env = "REMOTE_ROLE")]
    role: Option<ConnectionType>,

    /// Channel key shared with the other side.
    #[arg(long, env = "REMOTE_CHANNEL")]
    channel: Option<String>,

    /// Start with remote speech, tones and waves silenced.
    #[arg(long)]
    muted: bool,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed.
    fn into_client_config(self) -> anyhow::Result<ClientConfig> {
        let path = self.config.or_else(default_config_path);
        let mut config = load_config(path.as_deref()).with_context(|| {
            format!(
                "failed to load config from {}",
                path.as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            )
        })?;

        if let Some(host) = self.host {
            config.connection.host = host;
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(role) = self.role {
            config.connection.role = role;
        }
        if self.channel.is_some() {
            config.connection.channel = self.channel;
        }
        if self.muted {
            config.session.muted = true;
        }
        Ok(config)
    }
}

/// One log line for a `channel_joined` record, if it names the channel.
fn channel_joined_summary(joined: &ChannelJoined) -> Option<String> {
    let channel = joined.channel.as_ref()?;
    Some(format!(
        "joined channel {channel} with {} peer(s)",
        joined.peer_ids().len()
    ))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_client_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    let role = config.connection.role;
    info!(
        "remote client starting as {role}, relay {}",
        config.connection.address()
    );

    let source: Arc<dyn LocalEventSource> =
        Arc::new(ConsoleEventSource::new().with_braille_cells(config.session.braille_cells));
    let transport = RelayTransport::new(
        config.connection.tcp_config(),
        config.connection.channel_token(),
        role,
    );

    transport.callbacks().register(
        &MessageType::ChannelJoined.event(),
        callback(|fields| {
            let joined: ChannelJoined = remote_core::protocol::codec::from_fields(fields)?;
            if let Some(summary) = channel_joined_summary(&joined) {
                info!("{summary}");
            }
            Ok(())
        }),
    );

    // ── Session for the configured role ───────────────────────────────────────
    let link: Arc<dyn SessionLink> = transport.clone();
    let (_controller, _controlled) = match role {
        ConnectionType::Controller => {
            let options = ControllerOptions {
                index_poll_interval: config.session.index_poll_interval(),
                muted: config.session.muted,
            };
            let session = ControllerSession::with_options(link, source, options);
            (Some(session), None)
        }
        ConnectionType::Controlled => (None, Some(ControlledSession::new(link, source))),
    };

    Arc::clone(&transport).start();

    // ── Run until Ctrl+C ──────────────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl+C signal: {e}");
    }
    info!("shutdown signal received");

    transport.close().await;
    info!(
        "remote client stopped after {} connection(s)",
        transport.successful_connects()
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
