//! Peer identity, role and pairing token.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier the relay assigns to each connected client.
///
/// Point-to-point virtual channels have no relay, so the single remote peer
/// is always addressed as [`DIRECT_PEER`].
pub type PeerId = i64;

/// The implicit peer on the far side of a point-to-point channel.
pub const DIRECT_PEER: PeerId = -1;

/// The two roles a session endpoint can play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Sends input, receives speech/braille/tones.
    Controller,
    /// Executes input, mirrors its speech/braille/tones.
    Controlled,
}

impl ConnectionType {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Controlled => "controlled",
        }
    }

    /// The role a peer of this endpoint is expected to have.
    pub fn opposite(self) -> Self {
        match self {
            Self::Controller => Self::Controlled,
            Self::Controlled => Self::Controller,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role string is neither `controller` nor `controlled`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown connection type '{0}' (expected 'controller' or 'controlled')")]
pub struct ParseConnectionTypeError(pub String);

impl FromStr for ConnectionType {
    type Err = ParseConnectionTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" | "master" => Ok(Self::Controller),
            "controlled" | "slave" => Ok(Self::Controlled),
            _ => Err(ParseConnectionTypeError(s.to_string())),
        }
    }
}

/// Opaque pairing key both peers present to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelToken(String);

impl ChannelToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChannelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ChannelToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}
