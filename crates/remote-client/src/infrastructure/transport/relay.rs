//! TCP transport that performs the relay join handshake.
//!
//! Every time a connection is established, [`RelayTransport`] announces the
//! protocol version and then either joins its channel or, when it has no
//! channel token yet, asks the relay to generate one.  The generated key is
//! adopted as the channel and joined immediately, and reused on every
//! reconnect.
//!
//! A `version_mismatch` reply ends the connection and stops the reconnect
//! supervisor: retrying with the same version cannot succeed.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use remote_core::protocol::codec::from_fields;
use remote_core::protocol::messages::{GenerateKey, Join, ProtocolVersion};
use remote_core::{callback, events, ChannelToken, ConnectionType, MessageType, PROTOCOL_VERSION};
use tracing::{info, warn};

use super::tcp::{TcpTransport, TcpTransportConfig};
use super::{Transport, TransportCore, TransportError};
use crate::application::session::SessionLinkExt;

/// A [`TcpTransport`] connected to a relay server.
pub struct RelayTransport {
    tcp: TcpTransport,
    connection_type: ConnectionType,
    channel: Mutex<Option<ChannelToken>>,
    protocol_version: u32,
}

impl RelayTransport {
    /// Creates the transport and wires its handshake handlers.  Call
    /// [`Transport::start`] to begin connecting.
    pub fn new(
        config: TcpTransportConfig,
        channel: Option<ChannelToken>,
        connection_type: ConnectionType,
    ) -> Arc<Self> {
        Self::with_protocol_version(config, channel, connection_type, PROTOCOL_VERSION)
    }

    /// Like [`new`](Self::new) but announcing a specific protocol version.
    pub fn with_protocol_version(
        config: TcpTransportConfig,
        channel: Option<ChannelToken>,
        connection_type: ConnectionType,
        protocol_version: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let tcp = TcpTransport::new(config);
            let callbacks = tcp.core().callbacks();

            let this = weak.clone();
            callbacks.register(
                events::TRANSPORT_CONNECTED,
                callback(move |_| {
                    if let Some(transport) = this.upgrade() {
                        transport.announce();
                    }
                    Ok(())
                }),
            );

            let this = weak.clone();
            callbacks.register(
                &MessageType::GenerateKey.event(),
                callback(move |fields| {
                    let reply: GenerateKey = from_fields(fields)?;
                    if let (Some(transport), Some(key)) = (this.upgrade(), reply.key) {
                        transport.adopt_key(key);
                    }
                    Ok(())
                }),
            );

            let this = weak.clone();
            callbacks.register(
                &MessageType::VersionMismatch.event(),
                callback(move |_| {
                    if let Some(transport) = this.upgrade() {
                        warn!(
                            "relay at {} rejected protocol version {}",
                            transport.tcp.address(),
                            transport.protocol_version
                        );
                        transport.tcp.core().fail_handshake();
                    }
                    Ok(())
                }),
            );

            Self {
                tcp,
                connection_type,
                channel: Mutex::new(channel.filter(|c| !c.is_empty())),
                protocol_version,
            }
        })
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// The channel this transport joins, once known.
    pub fn channel(&self) -> Option<ChannelToken> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn announce(&self) {
        self.send_message(&ProtocolVersion {
            version: self.protocol_version,
        });
        match self.channel() {
            Some(channel) => self.join(channel),
            None => {
                info!("no channel token configured; requesting one from the relay");
                self.send_message(&GenerateKey::default());
            }
        }
    }

    fn join(&self, channel: ChannelToken) {
        info!("joining channel as {}", self.connection_type);
        self.send_message(&Join {
            channel,
            connection_type: self.connection_type,
        });
    }

    fn adopt_key(&self, key: ChannelToken) {
        {
            let mut channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
            if channel.is_some() {
                return;
            }
            *channel = Some(key.clone());
        }
        info!("relay generated channel key {key}");
        self.join(key);
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn core(&self) -> &TransportCore {
        self.tcp.core()
    }

    async fn run(&self) -> Result<(), TransportError> {
        self.tcp.run().await
    }
}
