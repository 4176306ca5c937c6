//! Infrastructure layer for remote-relay.
//!
//! Binds the TCP listener, runs one reader task and one writer task per
//! client, and handles the graceful shutdown signal.  Every decision about
//! what a record means is delegated to the application layer.

pub mod server;

pub use server::{bind, run_server, serve};
