//! remote-relay library crate.
//!
//! A channel relay for remote accessibility sessions.  Controller and
//! controlled clients that cannot reach each other directly both connect
//! here, join the same channel key, and the relay forwards their records to
//! each other.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! remote-client (controller)      remote-client (controlled)
//!            ↘                          ↙
//!   [remote-relay]   newline-delimited JSON over TCP
//!     ├── domain/           RelayConfig, ChannelRegistry
//!     ├── application/      RelayService: handshake, membership, forwarding
//!     └── infrastructure/
//!           └── server/     accept loop, per-client reader and writer tasks
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `remote-core`; it queues outgoing
//!   frames on channels and never awaits.
//! - `infrastructure` owns the sockets and the Tokio tasks.

/// Domain layer: configuration and channel membership.
pub mod domain;

/// Application layer: record handling and routing.
pub mod application;

/// Infrastructure layer: TCP server.
pub mod infrastructure;
