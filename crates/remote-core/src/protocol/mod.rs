//! Protocol module containing message types, the JSON line serializer and
//! the receive-side framer.

pub mod codec;
pub mod framing;
pub mod messages;

pub use codec::{from_fields, to_fields, Fields, JsonSerializer, ProtocolError, Serializer};
pub use framing::LineFramer;
pub use messages::*;
