//! Domain vocabulary shared by both peers and the relay.
//!
//! Nothing in here knows about sockets or JSON framing; the types only carry
//! serde derives so they can appear inside wire payloads.

pub mod peer;

pub use peer::{ChannelToken, ConnectionType, ParseConnectionTypeError, PeerId, DIRECT_PEER};
