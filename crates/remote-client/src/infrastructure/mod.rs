//! Infrastructure layer for the client.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `remote_core`, but MUST NOT be imported by the `application` layer
//! outside of tests.
//!
//! # Sub-modules
//!
//! - **`transport`** – TCP, relay and virtual-channel transports with the
//!   shared reconnect supervisor, plus a `MockLink` for session tests.
//! - **`local_events`** – host adapters: a console logger for the binary and
//!   a recording source for tests.
//! - **`storage`** – TOML configuration loading.

pub mod local_events;
pub mod storage;
pub mod transport;
