//! Domain layer for remote-relay.
//!
//! Pure types with no I/O: the relay configuration and the channel
//! membership registry.  Neither knows about sockets or tasks, so both can be
//! tested without a runtime.

pub mod channels;
pub mod config;

pub use channels::{ChannelRegistry, Member};
pub use config::RelayConfig;
