//! Application layer of the client.
//!
//! - **`local_events`** – the [`LocalEventSource`](local_events::LocalEventSource)
//!   trait a host implements, plus the capture event names.
//! - **`session`** – the controller and controlled session state machines.
//!   They depend on the [`SessionLink`](session::SessionLink) trait rather
//!   than on a concrete transport.

pub mod local_events;
pub mod session;
