//! Application layer for remote-relay.
//!
//! Knows *what* the relay does with each record (answer the handshake, track
//! channel membership, forward everything else) but never touches a socket.
//!
//! # Responsibilities
//!
//! - Assigning client ids and holding each client's outbox
//! - Handling `protocol_version`, `join` and `generate_key`
//! - Forwarding all other records to the rest of the channel
//! - Defining the `RelayError` type for record-level failures
//!
//! # What does NOT belong here?
//!
//! - Accepting connections and spawning tasks (that is infrastructure)
//! - Line framing of the byte stream (handled by `remote_core::LineFramer`)

pub mod relay_service;

pub use relay_service::{Disposition, Outbox, RelayError, RelayService};
