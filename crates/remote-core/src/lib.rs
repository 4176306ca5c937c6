//! # remote-core
//!
//! Shared library for the remote accessibility session: the line-oriented
//! JSON wire protocol, the receive-side line framer, the publish/subscribe
//! callback registry, and the small domain vocabulary (roles, peer ids,
//! channel tokens) both peers and the relay agree on.
//!
//! This crate performs no I/O.  Sockets, reconnect supervision and the
//! session state machines live in `remote-client`; the relay server lives in
//! `remote-relay`.
//!
//! # Architecture overview (for beginners)
//!
//! Two machines share one screen-reader session.  The **controller** sends
//! keystrokes and gestures and hears the other machine's speech; the
//! **controlled** machine executes those keystrokes and mirrors its speech,
//! tones and braille back.  Every record on the wire is a single JSON object
//! terminated by `\n`:
//!
//! ```text
//! {"type":"speak","sequence":["Hello"]}\n
//! ```
//!
//! - **`protocol`** – message types, typed payloads, the [`Serializer`] and
//!   the [`LineFramer`] that turns a byte stream back into whole records.
//! - **`callbacks`** – the [`CallbackManager`] that routes a received record
//!   (`type = "speak"` becomes the event `msg_speak`) to every handler
//!   registered for it.
//! - **`domain`** – pure value types with no dependencies on the above.

pub mod callbacks;
pub mod domain;
pub mod protocol;

pub use callbacks::{callback, events, Callback, CallbackError, CallbackManager};
pub use domain::{ChannelToken, ConnectionType, PeerId, DIRECT_PEER};
pub use protocol::codec::{Fields, JsonSerializer, ProtocolError, Serializer};
pub use protocol::framing::LineFramer;
pub use protocol::messages::{MessageType, WireMessage, PROTOCOL_VERSION};
