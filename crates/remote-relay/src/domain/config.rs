//! Relay configuration.
//!
//! [`RelayConfig`] is built once at startup from CLI arguments (see
//! `main.rs`) or from defaults in tests, then shared by every connection.

use std::net::{Ipv4Addr, SocketAddr};

use remote_core::PROTOCOL_VERSION;

/// Port relays listen on by default.
pub const DEFAULT_PORT: u16 = 6837;

/// All runtime configuration for the relay.
///
/// ```rust
/// use remote_relay::domain::RelayConfig;
///
/// let cfg = RelayConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 6837);
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the TCP listener binds to.  `0.0.0.0` accepts connections on
    /// every interface.
    pub bind_addr: SocketAddr,

    /// The only protocol version clients may announce.  Any other version is
    /// answered with `version_mismatch` and the connection is closed.
    pub protocol_version: u32,

    /// Records queued per client before further records to it are dropped.
    pub send_queue_capacity: usize,
}

impl Default for RelayConfig {
    /// | Field               | Default        |
    /// |---------------------|----------------|
    /// | bind_addr           | `0.0.0.0:6837` |
    /// | protocol_version    | `2`            |
    /// | send_queue_capacity | `1024`         |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            protocol_version: PROTOCOL_VERSION,
            send_queue_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_binds_all_interfaces_on_6837() {
        // Arrange / Act
        let cfg = RelayConfig::default();

        // Assert
        assert_eq!(cfg.bind_addr.port(), 6837);
        assert!(cfg.bind_addr.ip().is_unspecified());
    }

    #[test]
    fn test_default_protocol_version_matches_clients() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION);
    }
}
