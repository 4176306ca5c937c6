//! remote-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does remote-client do? (for beginners)
//!
//! Two machines running a screen reader share one session through a relay
//! server.  The *controller* types gestures that execute on the *controlled*
//! machine, and hears the speech, tones and braille the controlled machine
//! produces in response.
//!
//! The client:
//!
//! 1. Connects to the relay (or to a virtual channel in a remote desktop
//!    session), announces its protocol version and joins a channel.
//! 2. Keeps the connection alive, reconnecting after a delay whenever it
//!    drops.
//! 3. Runs a session for its role that translates between wire records and
//!    the local host's speech, braille and input.

/// Application layer: sessions and the host seam.
pub mod application;

/// Infrastructure layer: transports, host adapters and configuration.
pub mod infrastructure;
